//! Presence tracking: which user ids are connected to which room.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::RelayError;

/// Room key shared by every diff (multi-chat) session.
pub const DIFF_ROOM_KEY: &str = "diff:peers";

/// Room key for the peers of one chat.
pub fn chat_room_key(chat_id: &str) -> String {
    format!("chat:{chat_id}:peers")
}

/// Set-membership store used to reject duplicate user ids.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn exists(&self, user_id: &str, set_key: &str) -> Result<bool, RelayError>;

    /// Returns `true` when the user was newly added, `false` if already a member.
    async fn add(&self, user_id: &str, set_key: &str) -> Result<bool, RelayError>;

    async fn remove(&self, user_id: &str, set_key: &str) -> Result<(), RelayError>;
}

/// In-process presence store. Empty sets are dropped on removal.
#[derive(Debug, Default)]
pub struct MemoryPresence {
    sets: RwLock<HashMap<String, HashSet<String>>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Members of a room, sorted.
    pub async fn members(&self, set_key: &str) -> Vec<String> {
        let sets = self.sets.read().await;
        let mut members: Vec<String> = sets
            .get(set_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.sets.read().await.len()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn exists(&self, user_id: &str, set_key: &str) -> Result<bool, RelayError> {
        let sets = self.sets.read().await;
        Ok(sets.get(set_key).is_some_and(|set| set.contains(user_id)))
    }

    async fn add(&self, user_id: &str, set_key: &str) -> Result<bool, RelayError> {
        let mut sets = self.sets.write().await;
        let added = sets
            .entry(set_key.to_string())
            .or_default()
            .insert(user_id.to_string());
        debug!(user_id, set_key, added, "presence add");
        Ok(added)
    }

    async fn remove(&self, user_id: &str, set_key: &str) -> Result<(), RelayError> {
        let mut sets = self.sets.write().await;
        if let Some(set) = sets.get_mut(set_key) {
            set.remove(user_id);
            if set.is_empty() {
                sets.remove(set_key);
            }
        }
        debug!(user_id, set_key, "presence remove");
        Ok(())
    }
}
