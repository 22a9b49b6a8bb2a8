//! Chat message model and the envelope sent to peers over the socket.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Info text sent when a user id is already connected to a room.
pub const NAME_TAKEN: &str = "this name is already taken";

/// Info text sent when a collaborator fails while a peer is connecting.
pub const RETRY_LATER: &str = "something went wrong, please try again later";

/// A single chat message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub msg_id: Uuid,
    pub chat_id: String,
    pub sender_id: String,
    pub payload: String,
    /// Unix timestamp (seconds)
    pub created_at: i64,
}

impl ChatMessage {
    pub fn new(
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            msg_id: Uuid::new_v4(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            payload: payload.into(),
            created_at: Utc::now().timestamp(),
        }
    }
}

/// What a peer receives on the wire.
///
/// `{"type":"info","body":"..."}` for status text, `{"type":"chat","message":{...}}`
/// for relayed chat messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Notification {
    Info { body: String },
    Chat { message: ChatMessage },
}

impl Notification {
    pub fn info(body: impl Into<String>) -> Self {
        Notification::Info { body: body.into() }
    }

    pub fn chat(message: ChatMessage) -> Self {
        Notification::Chat { message }
    }

    pub fn welcome(chat_id: &str) -> Self {
        Self::info(format!("Welcome! You are connected to chat {chat_id}"))
    }

    pub fn watching(count: usize) -> Self {
        Self::info(format!("watching {count} chats"))
    }

    pub fn name_taken() -> Self {
        Self::info(NAME_TAKEN)
    }

    pub fn retry_later() -> Self {
        Self::info(RETRY_LATER)
    }

    pub fn is_info(&self) -> bool {
        matches!(self, Notification::Info { .. })
    }
}
