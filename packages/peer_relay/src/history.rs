//! Chat history: append-only message log with per-reader cursors.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::RelayError;
use crate::model::ChatMessage;

/// Default cap on messages returned by one `fetch_updates` call.
pub const DEFAULT_FETCH_BATCH: usize = 200;

#[async_trait]
pub trait ChatHistory: Send + Sync {
    async fn save(&self, message: &ChatMessage) -> Result<(), RelayError>;

    /// Messages of `chat_id` that `peer_id` has not fetched yet, oldest first.
    /// Advances the reader's cursor past everything returned.
    async fn fetch_updates(
        &self,
        chat_id: &str,
        peer_id: &str,
    ) -> Result<Vec<ChatMessage>, RelayError>;
}

#[derive(Default)]
struct HistoryInner {
    chats: HashMap<String, Vec<ChatMessage>>,
    /// (chat_id, peer_id) -> number of messages already fetched
    cursors: HashMap<(String, String), usize>,
}

/// In-process chat history.
pub struct MemoryHistory {
    inner: Mutex<HistoryInner>,
    batch: usize,
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_BATCH)
    }
}

impl MemoryHistory {
    pub fn new(batch: usize) -> Self {
        Self {
            inner: Mutex::new(HistoryInner::default()),
            batch: batch.max(1),
        }
    }

    /// All stored messages of a chat, oldest first.
    pub async fn messages(&self, chat_id: &str) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .await
            .chats
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatHistory for MemoryHistory {
    async fn save(&self, message: &ChatMessage) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().await;
        inner
            .chats
            .entry(message.chat_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn fetch_updates(
        &self,
        chat_id: &str,
        peer_id: &str,
    ) -> Result<Vec<ChatMessage>, RelayError> {
        let mut inner = self.inner.lock().await;
        let key = (chat_id.to_string(), peer_id.to_string());
        let seen = inner.cursors.get(&key).copied().unwrap_or(0);

        let updates: Vec<ChatMessage> = inner
            .chats
            .get(chat_id)
            .map(|log| log.iter().skip(seen).take(self.batch).cloned().collect())
            .unwrap_or_default();

        if !updates.is_empty() {
            inner.cursors.insert(key, seen + updates.len());
        }
        Ok(updates)
    }
}
