//! Shared collaborators and outcomes for every socket session.

use std::sync::Arc;

use peer_relay::{ChatHistory, MessageBus, Notification, PresenceStore};

use crate::AppState;
use crate::config::RelayConfig;
use crate::metrics::ServerMetrics;

/// Everything a session needs from the server, cloned per connection.
#[derive(Clone)]
pub struct RelayContext {
    pub presence: Arc<dyn PresenceStore>,
    pub bus: Arc<dyn MessageBus>,
    pub history: Arc<dyn ChatHistory>,
    pub config: RelayConfig,
    pub metrics: Option<Arc<ServerMetrics>>,
}

impl RelayContext {
    pub fn from_state(state: &AppState) -> Self {
        Self {
            presence: state.presence.clone(),
            bus: state.bus.clone(),
            history: state.history.clone(),
            config: state.server_config.relay.clone(),
            metrics: Some(state.metrics.clone()),
        }
    }

    pub(crate) fn record(&self, f: impl FnOnce(&ServerMetrics)) {
        if let Some(ref m) = self.metrics {
            f(m);
        }
    }
}

/// Why a connecting peer was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The user id is already connected to this room
    NameTaken,
    /// A collaborator failed or timed out while connecting
    StoreError,
}

impl RejectReason {
    pub fn notification(self) -> Notification {
        match self {
            RejectReason::NameTaken => Notification::name_taken(),
            RejectReason::StoreError => Notification::retry_later(),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Rejected(RejectReason),
    /// `clean` is false when the session ended on a read error or a dead relay
    Closed { clean: bool },
}
