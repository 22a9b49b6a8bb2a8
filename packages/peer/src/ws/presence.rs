//! Presence arbitration for connecting peers.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use peer_relay::PresenceStore;

use super::context::RejectReason;

/// A user's registration in a presence room, held for the life of a session.
///
/// Call [`PresenceLease::release`] on the way out. If a lease is dropped
/// without being released (task aborted, panic) removal is scheduled on the
/// current runtime instead.
pub(crate) struct PresenceLease {
    store: Arc<dyn PresenceStore>,
    user_id: String,
    room: String,
    released: bool,
}

impl PresenceLease {
    /// Check-then-register. An existing member is rejected without calling `add`.
    pub(crate) async fn acquire(
        store: Arc<dyn PresenceStore>,
        user_id: &str,
        room: &str,
        limit: Duration,
    ) -> Result<Self, RejectReason> {
        let existing = timeout(limit, store.exists(user_id, room)).await;
        match existing {
            Ok(Ok(false)) => {}
            Ok(Ok(true)) => {
                info!(user_id, room, "Rejecting duplicate connection");
                return Err(RejectReason::NameTaken);
            }
            Ok(Err(e)) => {
                warn!(user_id, room, "Presence check failed: {}", e);
                return Err(RejectReason::StoreError);
            }
            Err(_) => {
                warn!(user_id, room, "Presence check timed out");
                return Err(RejectReason::StoreError);
            }
        }

        let added = timeout(limit, store.add(user_id, room)).await;
        match added {
            Ok(Ok(true)) => Ok(Self {
                store,
                user_id: user_id.to_string(),
                room: room.to_string(),
                released: false,
            }),
            Ok(Ok(false)) => {
                // Lost a race with another connection for the same id
                info!(user_id, room, "Rejecting duplicate connection");
                Err(RejectReason::NameTaken)
            }
            Ok(Err(e)) => {
                warn!(user_id, room, "Presence registration failed: {}", e);
                Err(RejectReason::StoreError)
            }
            Err(_) => {
                warn!(user_id, room, "Presence registration timed out");
                // The add may still land; undo it in the background
                let (user_id, room) = (user_id.to_string(), room.to_string());
                tokio::spawn(async move {
                    let _ = store.remove(&user_id, &room).await;
                });
                Err(RejectReason::StoreError)
            }
        }
    }

    pub(crate) async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.store.remove(&self.user_id, &self.room).await {
            warn!(user_id = %self.user_id, room = %self.room, "Failed to remove presence: {}", e);
        }
    }
}

impl Drop for PresenceLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let user_id = std::mem::take(&mut self.user_id);
        let room = std::mem::take(&mut self.room);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.remove(&user_id, &room).await {
                        warn!(user_id = %user_id, room = %room, "Failed to remove presence: {}", e);
                    }
                });
            }
            Err(_) => warn!(user_id = %user_id, room = %room, "Presence leaked: no runtime to release it"),
        }
    }
}
