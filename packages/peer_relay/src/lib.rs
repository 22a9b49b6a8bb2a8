//! Peer Relay - chat relay core
//!
//! This crate holds the transport-agnostic half of the peer service: the
//! message model and wire envelope, the collaborator seams a session talks to
//! (presence, message bus, chat history) with in-process implementations, and
//! the polling chat queue used by the single-room peer model.
//! It has no HTTP or SQL dependencies.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use peer_relay::{ChatMessage, MemoryBus, MessageBus, chat_channel};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = Arc::new(MemoryBus::new(64));
//!     let mut stream = bus.subscribe(&chat_channel("lobby")).await.unwrap();
//!
//!     let msg = ChatMessage::new("lobby", "alice", "hi");
//!     bus.publish(&chat_channel("lobby"), &msg).await.unwrap();
//!
//!     let received = stream.next().await.unwrap();
//!     assert_eq!(received.payload, "hi");
//! }
//! ```

pub mod bus;
mod error;
pub mod history;
pub mod model;
pub mod presence;
pub mod queue;

pub use bus::{MemoryBus, MessageBus, MessageStream, chat_channel};
pub use error::RelayError;
pub use history::{ChatHistory, MemoryHistory};
pub use model::{ChatMessage, Notification};
pub use presence::{DIFF_ROOM_KEY, MemoryPresence, PresenceStore, chat_room_key};
pub use queue::{Chat, ManagerConfig, ManagerStats, MessageManager, Peer, ScanReport};
