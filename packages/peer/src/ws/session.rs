//! Single-chat session: the pub/sub relay path.
//!
//! Lifecycle: presence check → register → subscribe → welcome → relay until
//! the peer leaves. Teardown (stop relay, release presence, close socket)
//! runs on every exit path.

use axum::extract::ws::Message;
use futures::{Sink, Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use peer_relay::{ChatMessage, Notification, chat_channel, chat_room_key};

use super::context::{RejectReason, RelayContext, SessionOutcome};
use super::outbound::{relay_loop, spawn_writer};
use super::protocol::binary_text;
use super::presence::PresenceLease;

pub struct Session {
    user_id: String,
    chat_id: String,
    conn_id: String,
    ctx: RelayContext,
}

impl Session {
    pub fn new(user_id: impl Into<String>, chat_id: impl Into<String>, ctx: RelayContext) -> Self {
        Self {
            user_id: user_id.into(),
            chat_id: chat_id.into(),
            conn_id: uuid::Uuid::new_v4().to_string(),
            ctx,
        }
    }

    /// Run the session over the two halves of a socket until it ends.
    pub async fn start<W, R, E>(self, sink: W, mut stream: R) -> SessionOutcome
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display + Send,
    {
        let Session {
            user_id,
            chat_id,
            conn_id,
            ctx,
        } = self;
        let (tx, writer) = spawn_writer(sink, &ctx, conn_id.clone());

        let lease = match PresenceLease::acquire(
            ctx.presence.clone(),
            &user_id,
            &chat_room_key(&chat_id),
            ctx.config.presence_timeout,
        )
        .await
        {
            Ok(lease) => lease,
            Err(reason) => return reject(&ctx, tx, writer, reason).await,
        };

        let channel = chat_channel(&chat_id);
        let subscription = match ctx.bus.subscribe(&channel).await {
            Ok(s) => s,
            Err(e) => {
                error!(conn_id = %conn_id, chat_id = %chat_id, "Failed to subscribe: {}", e);
                lease.release().await;
                return reject(&ctx, tx, writer, RejectReason::StoreError).await;
            }
        };

        // Queued ahead of anything the relay forwards, so it is always seen first
        if tx.send(Notification::welcome(&chat_id)).await.is_err() {
            warn!(conn_id = %conn_id, "Writer closed before welcome");
        }

        let cancel = CancellationToken::new();
        let relay = tokio::spawn(relay_loop(
            subscription,
            tx.clone(),
            cancel.clone(),
            conn_id.clone(),
        ));
        info!(conn_id = %conn_id, user_id = %user_id, chat_id = %chat_id, "Session active");

        let clean = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        relay_inbound(&ctx, &chat_id, &user_id, text.as_str().to_owned()).await;
                    }
                    Some(Ok(Message::Binary(data))) => match binary_text(&data) {
                        Some(payload) => relay_inbound(&ctx, &chat_id, &user_id, payload).await,
                        None => warn!(conn_id = %conn_id, bytes = data.len(), "Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break true,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(conn_id = %conn_id, user_id = %user_id, "Socket read error: {}", e);
                        ctx.record(|m| m.websocket_error());
                        break false;
                    }
                },
                _ = cancel.cancelled() => {
                    warn!(conn_id = %conn_id, chat_id = %chat_id, "Relay ended, closing session");
                    break false;
                }
            }
        };

        teardown(cancel, relay, lease, tx, writer).await;
        info!(conn_id = %conn_id, user_id = %user_id, chat_id = %chat_id, clean, "Session closed");
        SessionOutcome::Closed { clean }
    }
}

/// Persist then publish one inbound frame. Failures are logged and counted,
/// never fatal to the session.
pub(crate) async fn relay_inbound(ctx: &RelayContext, chat_id: &str, user_id: &str, payload: String) {
    let message = ChatMessage::new(chat_id, user_id, payload);
    ctx.record(|m| m.message_received());

    if let Err(e) = ctx.history.save(&message).await {
        warn!(msg_id = %message.msg_id, chat_id, "Failed to persist message: {}", e);
        ctx.record(|m| m.persist_failed());
    }
    if let Err(e) = ctx.bus.publish(&chat_channel(chat_id), &message).await {
        warn!(msg_id = %message.msg_id, chat_id, "Failed to publish message: {}", e);
        ctx.record(|m| m.publish_failed());
    } else {
        debug!(msg_id = %message.msg_id, chat_id, "Message published");
    }
}

/// Tell the peer why, then close.
pub(crate) async fn reject(
    ctx: &RelayContext,
    tx: mpsc::Sender<Notification>,
    writer: JoinHandle<()>,
    reason: RejectReason,
) -> SessionOutcome {
    ctx.record(|m| m.session_rejected());
    let _ = tx.send(reason.notification()).await;
    drop(tx);
    let _ = writer.await;
    SessionOutcome::Rejected(reason)
}

/// Stop the relay (and wait for it), release presence, then let the writer
/// flush and close the socket.
pub(crate) async fn teardown(
    cancel: CancellationToken,
    relay: JoinHandle<()>,
    lease: PresenceLease,
    tx: mpsc::Sender<Notification>,
    writer: JoinHandle<()>,
) {
    cancel.cancel();
    if let Err(e) = relay.await {
        error!("Relay task failed: {}", e);
    }
    lease.release().await;
    drop(tx);
    let _ = writer.await;
}
