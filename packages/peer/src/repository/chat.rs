use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use peer_relay::ChatMessage;

use super::ChatRepository;

fn row_to_message(row: &SqliteRow) -> Result<(i64, ChatMessage)> {
    let msg_id: String = row.get("msg_id");
    let msg_id = Uuid::parse_str(&msg_id)
        .with_context(|| format!("Corrupt msg_id in chat_messages: {msg_id}"))?;
    Ok((
        row.get("seq"),
        ChatMessage {
            msg_id,
            chat_id: row.get("chat_id"),
            sender_id: row.get("sender_id"),
            payload: row.get("payload"),
            created_at: row.get("created_at"),
        },
    ))
}

impl ChatRepository {
    /// Append a message. Returns its sequence number.
    pub async fn insert_message(&self, msg: &ChatMessage) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO chat_messages (msg_id, chat_id, sender_id, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(msg.msg_id.to_string())
        .bind(&msg.chat_id)
        .bind(&msg.sender_id)
        .bind(&msg.payload)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert chat message")?;

        Ok(result.last_insert_rowid())
    }

    /// Messages of a chat with `seq > after_seq`, oldest first.
    pub async fn messages_after(
        &self,
        chat_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<(i64, ChatMessage)>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, msg_id, chat_id, sender_id, payload, created_at
            FROM chat_messages
            WHERE chat_id = ? AND seq > ?
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(chat_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to load messages for chat {chat_id}"))?;

        rows.iter().map(row_to_message).collect()
    }

    #[cfg(test)]
    pub async fn count_messages(&self, chat_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Last sequence number `peer_id` has read in `chat_id` (0 if never).
    pub async fn read_cursor(&self, chat_id: &str, peer_id: &str) -> Result<i64> {
        let seq: Option<i64> = sqlx::query_scalar(
            "SELECT last_seq FROM read_cursors WHERE chat_id = ? AND peer_id = ?",
        )
        .bind(chat_id)
        .bind(peer_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read cursor")?;
        Ok(seq.unwrap_or(0))
    }

    /// Move a reader's cursor forward. Never moves it backwards.
    pub async fn advance_read_cursor(&self, chat_id: &str, peer_id: &str, seq: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO read_cursors (chat_id, peer_id, last_seq, updated_at)
            VALUES (?, ?, ?, unixepoch())
            ON CONFLICT(chat_id, peer_id) DO UPDATE SET
                last_seq = MAX(last_seq, excluded.last_seq),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(chat_id)
        .bind(peer_id)
        .bind(seq)
        .execute(&self.pool)
        .await
        .context("Failed to advance read cursor")?;
        Ok(())
    }
}
