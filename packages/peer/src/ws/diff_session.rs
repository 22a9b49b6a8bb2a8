//! Diff session: one connection watching a replaceable set of chats.
//!
//! Inbound frames are watch lists (`["c1","c2"]`), not chat messages. Each
//! new list fully replaces the previous one; the old relay is stopped and
//! awaited before the new subscription is made.

use axum::extract::ws::Message;
use futures::{Sink, Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use peer_relay::{DIFF_ROOM_KEY, Notification, chat_channel};

use super::context::{RelayContext, SessionOutcome};
use super::outbound::{relay_loop, spawn_writer};
use super::presence::PresenceLease;
use super::protocol::{DIFF_WELCOME, binary_text, parse_watch_list};
use super::session::reject;

/// The relay currently serving a watch list.
struct ActiveWatch {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    chats: Vec<String>,
}

impl ActiveWatch {
    async fn stop(self, conn_id: &str) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!(conn_id, "Watch relay failed: {}", e);
        }
        debug!(conn_id, chats = ?self.chats, "Stopped watch");
    }
}

pub struct DiffSession {
    user_id: String,
    conn_id: String,
    ctx: RelayContext,
    watch: Option<ActiveWatch>,
}

impl DiffSession {
    pub fn new(user_id: impl Into<String>, ctx: RelayContext) -> Self {
        Self {
            user_id: user_id.into(),
            conn_id: uuid::Uuid::new_v4().to_string(),
            ctx,
            watch: None,
        }
    }

    pub async fn start<W, R, E>(mut self, sink: W, mut stream: R) -> SessionOutcome
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display + Send,
    {
        let (tx, writer) = spawn_writer(sink, &self.ctx, self.conn_id.clone());

        let lease = match PresenceLease::acquire(
            self.ctx.presence.clone(),
            &self.user_id,
            DIFF_ROOM_KEY,
            self.ctx.config.presence_timeout,
        )
        .await
        {
            Ok(lease) => lease,
            Err(reason) => return reject(&self.ctx, tx, writer, reason).await,
        };

        let _ = tx.send(Notification::info(DIFF_WELCOME)).await;
        info!(conn_id = %self.conn_id, user_id = %self.user_id, "Diff session active");

        let clean = loop {
            // relay_loop cancels its own token when the writer or bus subscription ends
            let relay_ended = self.watch.as_ref().map(|w| w.cancel.clone());
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = async {
                    match &relay_ended {
                        Some(token) => token.cancelled().await,
                        None => std::future::pending().await,
                    }
                } => {
                    warn!(conn_id = %self.conn_id, user_id = %self.user_id, "Watch relay ended, closing session");
                    break false;
                }
            };
            let text = match frame {
                Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                Some(Ok(Message::Binary(data))) => match binary_text(&data) {
                    Some(text) => text,
                    None => {
                        warn!(conn_id = %self.conn_id, bytes = data.len(), "Dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => break true,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(conn_id = %self.conn_id, user_id = %self.user_id, "Socket read error: {}", e);
                    self.ctx.record(|m| m.websocket_error());
                    break false;
                }
            };

            match parse_watch_list(&text) {
                Ok(chats) => self.replace_watch(chats, &tx).await,
                Err(e) => {
                    warn!(conn_id = %self.conn_id, "Ignoring frame: {}", e);
                }
            }
        };

        if let Some(watch) = self.watch.take() {
            watch.stop(&self.conn_id).await;
        }
        lease.release().await;
        drop(tx);
        let _ = writer.await;
        info!(conn_id = %self.conn_id, user_id = %self.user_id, clean, "Diff session closed");
        SessionOutcome::Closed { clean }
    }

    /// Swap the watch set. The previous relay has fully stopped before the
    /// acknowledgement for the new one is queued.
    async fn replace_watch(&mut self, chats: Vec<String>, tx: &mpsc::Sender<Notification>) {
        if let Some(previous) = self.watch.take() {
            previous.stop(&self.conn_id).await;
        }
        self.ctx.record(|m| m.watch_changed());

        if chats.is_empty() {
            let _ = tx.send(Notification::watching(0)).await;
            return;
        }

        let channels: Vec<String> = chats.iter().map(|c| chat_channel(c)).collect();
        let subscription = match self.ctx.bus.subscribe_many(&channels).await {
            Ok(s) => s,
            Err(e) => {
                error!(conn_id = %self.conn_id, "Failed to subscribe to watch list: {}", e);
                let _ = tx.send(Notification::retry_later()).await;
                return;
            }
        };

        let _ = tx.send(Notification::watching(chats.len())).await;
        for channel in &channels {
            match self.ctx.bus.snapshot(channel).await {
                Ok(Some(message)) => {
                    let _ = tx.send(Notification::chat(message)).await;
                }
                Ok(None) => {}
                Err(e) => warn!(conn_id = %self.conn_id, channel, "Snapshot unavailable: {}", e),
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(relay_loop(
            subscription,
            tx.clone(),
            cancel.clone(),
            self.conn_id.clone(),
        ));
        info!(conn_id = %self.conn_id, chats = ?chats, "Watching");
        self.watch = Some(ActiveWatch {
            cancel,
            handle,
            chats,
        });
    }
}
