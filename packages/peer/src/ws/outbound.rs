//! Socket writer and relay tasks.
//!
//! Each connection has exactly one writer task that owns the sink half of the
//! socket; everything else talks to the peer through its `mpsc` sender.

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, StreamExt};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use peer_relay::{MessageStream, Notification};

use super::context::RelayContext;

/// Spawn the writer for one connection. The writer drains notifications in
/// order and closes the socket once every sender is dropped, or after
/// `max_write_failures` consecutive failed writes.
pub(crate) fn spawn_writer<W>(
    mut sink: W,
    ctx: &RelayContext,
    conn_id: String,
) -> (mpsc::Sender<Notification>, JoinHandle<()>)
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
{
    let (tx, mut rx) = mpsc::channel::<Notification>(ctx.config.outbound_capacity);
    let max_failures = ctx.config.max_write_failures;
    let ctx = ctx.clone();

    let handle = tokio::spawn(async move {
        let mut consecutive_failures = 0u32;

        while let Some(notification) = rx.recv().await {
            let json = match serde_json::to_string(&notification) {
                Ok(j) => j,
                Err(e) => {
                    error!(conn_id = %conn_id, "Failed to serialize notification: {}", e);
                    continue;
                }
            };
            let is_chat = !notification.is_info();

            match sink.send(Message::Text(json.into())).await {
                Ok(()) => {
                    consecutive_failures = 0;
                    if is_chat {
                        ctx.record(|m| m.message_relayed());
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    ctx.record(|m| m.write_failed());
                    warn!(conn_id = %conn_id, failures = consecutive_failures, "Socket write failed: {}", e);
                    if consecutive_failures >= max_failures {
                        warn!(conn_id = %conn_id, "Giving up on socket after repeated write failures");
                        break;
                    }
                }
            }
        }

        // Close frame may fail if the peer is already gone
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
        debug!(conn_id = %conn_id, "Writer finished");
    });

    (tx, handle)
}

/// Forward bus messages to the writer until `cancel` fires, the subscription
/// ends, or the writer goes away. Cancels `cancel` on exit so the owning
/// session can observe a dead relay.
pub(crate) async fn relay_loop(
    mut subscription: MessageStream,
    tx: mpsc::Sender<Notification>,
    cancel: CancellationToken,
    conn_id: String,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = subscription.next() => {
                let Some(message) = next else {
                    warn!(conn_id = %conn_id, "Subscription closed");
                    break;
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = tx.send(Notification::chat(message)) => {
                        if sent.is_err() {
                            debug!(conn_id = %conn_id, "Writer closed, stopping relay");
                            break;
                        }
                    }
                }
            }
        }
    }
    cancel.cancel();
}
