//! Queue session: a socket attached to a chat served by the polling
//! [`MessageManager`](peer_relay::MessageManager).

use axum::extract::ws::Message;
use futures::{Sink, Stream, StreamExt, stream};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use peer_relay::{Chat, ChatMessage, MessageManager, MessageStream, Notification, Peer};

use super::context::{RelayContext, SessionOutcome};
use super::outbound::{relay_loop, spawn_writer};
use super::protocol::binary_text;

pub struct QueueSession {
    user_id: String,
    chat_id: String,
    conn_id: String,
    chat_capacity: usize,
    ctx: RelayContext,
    manager: Arc<MessageManager>,
}

impl QueueSession {
    pub fn new(
        user_id: impl Into<String>,
        chat_id: impl Into<String>,
        chat_capacity: usize,
        ctx: RelayContext,
        manager: Arc<MessageManager>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            chat_id: chat_id.into(),
            conn_id: uuid::Uuid::new_v4().to_string(),
            chat_capacity,
            ctx,
            manager,
        }
    }

    pub async fn start<W, R, E>(self, sink: W, mut stream: R) -> SessionOutcome
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display + Send,
    {
        let QueueSession {
            user_id,
            chat_id,
            conn_id,
            chat_capacity,
            ctx,
            manager,
        } = self;
        let (tx, writer) = spawn_writer(sink, &ctx, conn_id.clone());

        let chat = manager
            .enqueue_chat_if_not_exists(Chat::new(&chat_id, &user_id, chat_capacity))
            .await;
        let (peer, outbound) = Peer::new(&conn_id, &user_id, chat_capacity);
        chat.subscribe(peer.clone()).await;

        let _ = tx.send(Notification::welcome(&chat_id)).await;

        let cancel = CancellationToken::new();
        let relay = tokio::spawn(relay_loop(
            peer_stream(outbound),
            tx.clone(),
            cancel.clone(),
            conn_id.clone(),
        ));
        info!(conn_id = %conn_id, user_id = %user_id, chat_id = %chat_id, "Queue session active");

        let clean = loop {
            tokio::select! {
                frame = stream.next() => {
                    let payload = match frame {
                        Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(Message::Binary(data))) => match binary_text(&data) {
                            Some(text) => text,
                            None => {
                                warn!(conn_id = %conn_id, bytes = data.len(), "Dropping non-UTF-8 binary frame");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => break true,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(conn_id = %conn_id, "Socket read error: {}", e);
                            ctx.record(|m| m.websocket_error());
                            break false;
                        }
                    };
                    ctx.record(|m| m.message_received());
                    if let Err(e) = chat.submit(ChatMessage::new(&chat_id, &user_id, payload)) {
                        warn!(conn_id = %conn_id, chat_id = %chat_id, "Dropping message: {}", e);
                        ctx.record(|m| m.message_dropped());
                    }
                }
                _ = cancel.cancelled() => break false,
            }
        };

        chat.unsubscribe(peer.id()).await;
        cancel.cancel();
        if let Err(e) = relay.await {
            error!(conn_id = %conn_id, "Relay task failed: {}", e);
        }
        drop(tx);
        let _ = writer.await;
        info!(conn_id = %conn_id, user_id = %user_id, chat_id = %chat_id, clean, "Queue session closed");
        SessionOutcome::Closed { clean }
    }
}

fn peer_stream(rx: mpsc::Receiver<ChatMessage>) -> MessageStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) }).boxed()
}
