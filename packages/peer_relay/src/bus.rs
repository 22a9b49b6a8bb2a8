//! Message bus: per-channel pub/sub plus last-write-wins snapshots.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::model::ChatMessage;

/// A live subscription. Dropping it unsubscribes.
pub type MessageStream = BoxStream<'static, ChatMessage>;

/// Bus channel carrying the messages of one chat.
pub fn chat_channel(chat_id: &str) -> String {
    format!("chat:{chat_id}")
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver `message` to every current subscriber of `channel` and record
    /// it as the channel's snapshot.
    async fn publish(&self, channel: &str, message: &ChatMessage) -> Result<(), RelayError>;

    /// Subscribe to `channel`. Only messages published after this call
    /// returns are delivered.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, RelayError>;

    /// Subscribe to the union of several channels. Per-channel order is kept;
    /// there is no ordering across channels.
    async fn subscribe_many(&self, channels: &[String]) -> Result<MessageStream, RelayError> {
        let mut streams = Vec::with_capacity(channels.len());
        for channel in channels {
            streams.push(self.subscribe(channel).await?);
        }
        Ok(stream::select_all(streams).boxed())
    }

    /// Last message published on `channel`, if any.
    async fn snapshot(&self, channel: &str) -> Result<Option<ChatMessage>, RelayError>;
}

/// In-process bus backed by one tokio broadcast channel per bus channel.
///
/// A subscriber that falls more than `capacity` messages behind skips the
/// overflow (logged) rather than blocking publishers.
pub struct MemoryBus {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<ChatMessage>>>,
    snapshots: RwLock<HashMap<String, ChatMessage>>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Current number of live subscribers on `channel`.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop channels nobody listens to anymore. Returns how many were removed.
    /// Every `subscribe` does this too, so the map only grows with live channels.
    pub async fn prune_idle(&self) -> usize {
        retain_live(&mut *self.channels.write().await)
    }
}

fn retain_live(channels: &mut HashMap<String, broadcast::Sender<ChatMessage>>) -> usize {
    let before = channels.len();
    channels.retain(|_, tx| tx.receiver_count() > 0);
    before - channels.len()
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, message: &ChatMessage) -> Result<(), RelayError> {
        self.snapshots
            .write()
            .await
            .insert(channel.to_string(), message.clone());

        let channels = self.channels.read().await;
        match channels.get(channel) {
            Some(tx) => {
                // Err only means no live receivers
                let delivered = tx.send(message.clone()).unwrap_or(0);
                debug!(channel, delivered, "published");
            }
            None => debug!(channel, "published with no subscribers"),
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, RelayError> {
        let rx = {
            let mut channels = self.channels.write().await;
            let pruned = retain_live(&mut channels);
            if pruned > 0 {
                debug!(pruned, "dropped idle bus channels");
            }
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };
        Ok(receiver_stream(channel.to_string(), rx))
    }

    async fn snapshot(&self, channel: &str) -> Result<Option<ChatMessage>, RelayError> {
        Ok(self.snapshots.read().await.get(channel).cloned())
    }
}

fn receiver_stream(channel: String, rx: broadcast::Receiver<ChatMessage>) -> MessageStream {
    stream::unfold((channel, rx), |(channel, mut rx)| async move {
        loop {
            match rx.recv().await {
                Ok(message) => return Some((message, (channel, rx))),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(channel = %channel, skipped = n, "Subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
