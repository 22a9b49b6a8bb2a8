use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use peer_relay::{
    ChatMessage, MemoryBus, MemoryHistory, MemoryPresence, MessageBus, MessageManager,
    MessageStream, Notification, PresenceStore, RelayError,
};

use crate::AppState;
use crate::config::{PeerConfig, ServerConfig};
use crate::db::Database;
use crate::metrics::ServerMetrics;
use crate::repository::ChatRepository;
use crate::ws::RelayContext;

/// Upper bound for any single wait in async tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The client end of an in-memory socket.
pub struct FakePeer {
    to_server: Option<UnboundedSender<Result<Message, axum::Error>>>,
    from_server: UnboundedReceiver<Message>,
}

/// In-memory socket: the peer handle plus the sink and stream halves a
/// session runs on.
pub fn fake_socket() -> (
    FakePeer,
    UnboundedSender<Message>,
    UnboundedReceiver<Result<Message, axum::Error>>,
) {
    let (server_tx, from_server) = unbounded();
    let (to_server, server_rx) = unbounded();
    let peer = FakePeer {
        to_server: Some(to_server),
        from_server,
    };
    (peer, server_tx, server_rx)
}

impl FakePeer {
    fn push(&self, frame: Result<Message, axum::Error>) {
        if let Some(tx) = &self.to_server {
            let _ = tx.unbounded_send(frame);
        }
    }

    pub fn send_text(&self, text: &str) {
        self.push(Ok(Message::Text(text.to_string().into())));
    }

    pub fn send_binary(&self, data: &[u8]) {
        self.push(Ok(Message::Binary(data.to_vec().into())));
    }

    pub fn close(&self) {
        self.push(Ok(Message::Close(None)));
    }

    /// Deliver a transport error to the session's read loop.
    pub fn fail_read(&self) {
        self.push(Err(axum::Error::new(std::io::Error::other(
            "connection reset",
        ))));
    }

    /// Drop the inbound half without a close frame.
    pub fn hang_up(&mut self) {
        self.to_server = None;
    }

    async fn next_frame(&mut self) -> Option<Message> {
        tokio::time::timeout(TEST_TIMEOUT, self.from_server.next())
            .await
            .expect("timed out waiting for a frame")
    }

    pub async fn next_notification(&mut self) -> Notification {
        match self.next_frame().await {
            Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    pub async fn next_chat(&mut self) -> ChatMessage {
        match self.next_notification().await {
            Notification::Chat { message } => message,
            other => panic!("expected a chat notification, got {other:?}"),
        }
    }

    /// Read until the server closes, returning the notifications seen on the way.
    pub async fn expect_closed(&mut self) -> Vec<Notification> {
        let mut seen = Vec::new();
        loop {
            match self.next_frame().await {
                Some(Message::Text(text)) => seen.push(serde_json::from_str(text.as_str()).unwrap()),
                Some(Message::Close(_)) | None => return seen,
                Some(_) => {}
            }
        }
    }
}

/// Relay context over in-memory collaborators, with metrics attached.
pub fn test_relay_context() -> RelayContext {
    RelayContext {
        presence: Arc::new(MemoryPresence::new()),
        bus: Arc::new(MemoryBus::new(64)),
        history: Arc::new(MemoryHistory::default()),
        config: ServerConfig::default().relay,
        metrics: Some(Arc::new(ServerMetrics::new())),
    }
}

#[derive(Clone, Copy)]
enum PresenceScript {
    Member,
    Failing,
    Hanging,
}

/// Presence store with a fixed answer to `exists`. Counts `add` calls.
pub struct ScriptedPresence {
    script: PresenceScript,
    adds: AtomicUsize,
}

impl ScriptedPresence {
    fn new(script: PresenceScript) -> Self {
        Self {
            script,
            adds: AtomicUsize::new(0),
        }
    }

    /// Every user is already present.
    pub fn member() -> Self {
        Self::new(PresenceScript::Member)
    }

    /// Every call fails.
    pub fn failing() -> Self {
        Self::new(PresenceScript::Failing)
    }

    /// Every call waits forever.
    pub fn hanging() -> Self {
        Self::new(PresenceScript::Hanging)
    }

    pub fn add_calls(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    async fn answer<T>(&self, ok: T) -> Result<T, RelayError> {
        match self.script {
            PresenceScript::Member => Ok(ok),
            PresenceScript::Failing => Err(RelayError::Presence("store unavailable".into())),
            PresenceScript::Hanging => std::future::pending().await,
        }
    }
}

#[async_trait]
impl PresenceStore for ScriptedPresence {
    async fn exists(&self, _user_id: &str, _set_key: &str) -> Result<bool, RelayError> {
        self.answer(true).await
    }

    async fn add(&self, _user_id: &str, _set_key: &str) -> Result<bool, RelayError> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.answer(true).await
    }

    async fn remove(&self, _user_id: &str, _set_key: &str) -> Result<(), RelayError> {
        self.answer(()).await
    }
}

/// In-memory bus that can fail the next publish or end every subscription.
pub struct FailingBus {
    inner: MemoryBus,
    fail_next: AtomicBool,
    closed: CancellationToken,
}

impl FailingBus {
    pub fn new() -> Self {
        Self {
            inner: MemoryBus::new(64),
            fail_next: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub fn fail_next_publish(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn close_subscriptions(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl MessageBus for FailingBus {
    async fn publish(&self, channel: &str, message: &ChatMessage) -> Result<(), RelayError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RelayError::Bus("injected publish failure".into()));
        }
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, RelayError> {
        let stream = self.inner.subscribe(channel).await?;
        Ok(stream
            .take_until(self.closed.clone().cancelled_owned())
            .boxed())
    }

    async fn snapshot(&self, channel: &str) -> Result<Option<ChatMessage>, RelayError> {
        self.inner.snapshot(channel).await
    }
}

/// Build a fully-wired `AppState` backed by an in-memory SQLite database.
///
/// Returns `(AppState, TempDir)`; callers must hold the `TempDir` for the
/// lifetime of the test.
pub async fn test_app_state() -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    // Creates the data dir layout the server expects
    PeerConfig::new(Some(tmp.path().to_path_buf())).expect("config");

    let pool = crate::repository::test_helpers::test_pool().await;
    let db = Arc::new(Database { pool: pool.clone() });
    let server_config = ServerConfig::default();
    let history = Arc::new(ChatRepository::with_fetch_batch(
        pool,
        server_config.queue.fetch_batch,
    ));
    let manager = Arc::new(MessageManager::new(
        history.clone(),
        server_config.queue.manager_config(),
    ));

    let state = AppState {
        presence: Arc::new(MemoryPresence::new()),
        bus: Arc::new(MemoryBus::new(server_config.relay.bus_capacity)),
        history,
        manager,
        server_config: Arc::new(server_config),
        metrics: Arc::new(ServerMetrics::new()),
        db,
    };

    (state, tmp)
}
