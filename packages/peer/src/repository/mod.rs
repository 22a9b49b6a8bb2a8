// Repository layer: SQL lives in per-domain files with `impl ChatRepository`.
// This module wires the repository into the relay's `ChatHistory` seam.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;

use peer_relay::history::DEFAULT_FETCH_BATCH;
use peer_relay::{ChatHistory, ChatMessage, RelayError};

mod chat;

#[cfg(test)]
pub(crate) mod test_helpers;

#[derive(Clone)]
pub struct ChatRepository {
    pub(crate) pool: SqlitePool,
    fetch_batch: i64,
}

impl ChatRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_fetch_batch(pool, DEFAULT_FETCH_BATCH)
    }

    pub fn with_fetch_batch(pool: SqlitePool, fetch_batch: usize) -> Self {
        Self {
            pool,
            fetch_batch: fetch_batch.max(1) as i64,
        }
    }
}

fn history_error(err: anyhow::Error) -> RelayError {
    RelayError::History(format!("{err:#}"))
}

#[async_trait]
impl ChatHistory for ChatRepository {
    async fn save(&self, message: &ChatMessage) -> Result<(), RelayError> {
        self.insert_message(message)
            .await
            .map(|_| ())
            .map_err(history_error)
    }

    async fn fetch_updates(
        &self,
        chat_id: &str,
        peer_id: &str,
    ) -> Result<Vec<ChatMessage>, RelayError> {
        let cursor = self
            .read_cursor(chat_id, peer_id)
            .await
            .map_err(history_error)?;
        let rows = self
            .messages_after(chat_id, cursor, self.fetch_batch)
            .await
            .map_err(history_error)?;

        if let Some((last_seq, _)) = rows.last() {
            self.advance_read_cursor(chat_id, peer_id, *last_seq)
                .await
                .map_err(history_error)?;
        }
        Ok(rows.into_iter().map(|(_, message)| message).collect())
    }
}
