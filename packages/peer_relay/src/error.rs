use std::time::Duration;

/// Errors surfaced by the relay collaborators and the chat queue
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("presence store error: {0}")]
    Presence(String),

    #[error("message bus error: {0}")]
    Bus(String),

    #[error("chat history error: {0}")]
    History(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("queue full for chat {chat_id}")]
    QueueFull { chat_id: String },

    #[error("channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = RelayError::QueueFull {
            chat_id: "c1".into(),
        };
        assert_eq!(err.to_string(), "queue full for chat c1");

        let err = RelayError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "operation timed out after 250ms");
    }
}
