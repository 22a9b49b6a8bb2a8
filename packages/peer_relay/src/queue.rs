//! Chat queue - polling relay path
//!
//! The [`MessageManager`] keeps an ordered registry of [`Chat`]s, each owned by
//! one receiver, and periodically scans it: new history for the receiver is
//! appended to the chat's receive backlog, the backlog is drained into every
//! connected [`Peer`]'s outbound queue, and messages peers submitted are
//! flushed to the history store. All per-chat work is non-blocking or bounded
//! by a timeout so one slow chat never stalls a scan.
//!
//! History is only fetched while the chat has a connected peer and room in its
//! backlog, so the read cursor never moves past a message nobody can take.

use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::history::ChatHistory;
use crate::model::ChatMessage;

/// One connected participant of a polled chat.
#[derive(Debug)]
pub struct Peer {
    id: String,
    user_id: String,
    outbound: mpsc::Sender<ChatMessage>,
    connected: AtomicBool,
}

impl Peer {
    /// Create a peer and the receiving end of its outbound queue.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<ChatMessage>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let peer = Arc::new(Self {
            id: id.into(),
            user_id: user_id.into(),
            outbound,
            connected: AtomicBool::new(false),
        });
        (peer, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Free slots in the outbound queue.
    fn free_slots(&self) -> usize {
        self.outbound.capacity()
    }

    fn offer(&self, message: ChatMessage) -> Result<(), RelayError> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(m) => RelayError::QueueFull { chat_id: m.chat_id },
            mpsc::error::TrySendError::Closed(_) => RelayError::ChannelClosed,
        })
    }
}

/// A chat as seen by one receiver.
#[derive(Debug)]
pub struct Chat {
    chat_id: String,
    receiver_id: String,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    send_tx: mpsc::Sender<ChatMessage>,
    send_rx: Mutex<mpsc::Receiver<ChatMessage>>,
    backlog: Mutex<VecDeque<ChatMessage>>,
    capacity: usize,
}

impl Chat {
    /// `capacity` bounds the send queue and how full the receive backlog may
    /// get before the next fetch is deferred.
    pub fn new(chat_id: impl Into<String>, receiver_id: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (send_tx, send_rx) = mpsc::channel(capacity);
        Self {
            chat_id: chat_id.into(),
            receiver_id: receiver_id.into(),
            peers: RwLock::new(HashMap::new()),
            send_tx,
            send_rx: Mutex::new(send_rx),
            backlog: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    /// Add a peer. Re-subscribing a known peer id keeps the existing entry
    /// and marks it connected. Returns `true` if the peer was inserted.
    pub async fn subscribe(&self, peer: Arc<Peer>) -> bool {
        let mut peers = self.peers.write().await;
        if let Some(existing) = peers.get(peer.id()) {
            existing.set_connected(true);
            return false;
        }
        peer.set_connected(true);
        debug!(chat_id = %self.chat_id, peer_id = %peer.id(), "peer subscribed");
        peers.insert(peer.id().to_string(), peer);
        true
    }

    /// Remove a peer and mark it disconnected. Returns `true` if it was present.
    pub async fn unsubscribe(&self, peer_id: &str) -> bool {
        match self.peers.write().await.remove(peer_id) {
            Some(peer) => {
                peer.set_connected(false);
                debug!(chat_id = %self.chat_id, peer_id, "peer unsubscribed");
                true
            }
            None => false,
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    /// Queue a message for the next scan to persist. Never waits.
    pub fn submit(&self, message: ChatMessage) -> Result<(), RelayError> {
        self.send_tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::QueueFull {
                chat_id: self.chat_id.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => RelayError::ChannelClosed,
        })
    }

    pub async fn has_connected_peer(&self) -> bool {
        self.peers.read().await.values().any(|p| p.is_connected())
    }

    /// Messages fetched but not yet handed to peers.
    pub async fn backlog_len(&self) -> usize {
        self.backlog.lock().await.len()
    }

    /// Append fetched history to the receive backlog.
    pub async fn push_received(&self, messages: Vec<ChatMessage>) {
        self.backlog.lock().await.extend(messages);
    }

    async fn has_backlog_room(&self) -> bool {
        self.backlog.lock().await.len() < self.capacity
    }

    /// Move as much of the backlog as every connected peer can take right now,
    /// without waiting. Whatever does not fit stays queued for the next scan.
    /// Returns `(delivered, dropped)`; only closed peers drop messages.
    pub async fn deliver(&self) -> (usize, usize) {
        let peers = self.peers.read().await;
        let mut backlog = self.backlog.lock().await;
        let mut delivered = 0;
        let mut dropped = 0;

        loop {
            for peer in peers.values().filter(|p| p.outbound.is_closed()) {
                // receiver went away without unsubscribing
                peer.set_connected(false);
            }
            let connected: Vec<&Arc<Peer>> = peers.values().filter(|p| p.is_connected()).collect();
            let room = connected.iter().map(|p| p.free_slots()).min().unwrap_or(0);
            let batch = room.min(backlog.len());
            if batch == 0 {
                break;
            }

            let mut closed = false;
            for message in backlog.drain(..batch) {
                for peer in connected.iter().filter(|p| p.is_connected()) {
                    match peer.offer(message.clone()) {
                        Ok(()) => delivered += 1,
                        Err(RelayError::ChannelClosed) => {
                            peer.set_connected(false);
                            dropped += 1;
                            closed = true;
                        }
                        Err(e) => {
                            warn!(chat_id = %self.chat_id, peer_id = %peer.id(), error = %e, "Dropping message for slow peer");
                            dropped += 1;
                        }
                    }
                }
            }
            // a closed peer no longer caps the batch size
            if !closed {
                break;
            }
        }
        (delivered, dropped)
    }

    async fn drain_pending(&self) -> Vec<ChatMessage> {
        let mut rx = self.send_rx.lock().await;
        let mut pending = Vec::new();
        while let Ok(message) = rx.try_recv() {
            pending.push(message);
        }
        pending
    }
}

/// Tunables for the scan loop.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub scan_interval: Duration,
    /// Bound on each history call made during a scan
    pub fetch_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_millis(250),
            fetch_timeout: Duration::from_secs(1),
        }
    }
}

/// Outcome of one scan (or of one chat within a scan).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub chats: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub saved: usize,
    pub fetch_failures: usize,
    pub save_failures: usize,
}

impl ScanReport {
    fn merge(self, other: ScanReport) -> ScanReport {
        ScanReport {
            chats: self.chats + other.chats,
            delivered: self.delivered + other.delivered,
            dropped: self.dropped + other.dropped,
            saved: self.saved + other.saved,
            fetch_failures: self.fetch_failures + other.fetch_failures,
            save_failures: self.save_failures + other.save_failures,
        }
    }

    pub fn has_activity(&self) -> bool {
        self.delivered + self.dropped + self.saved + self.fetch_failures + self.save_failures > 0
    }
}

/// Running totals across all scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub scans: u64,
    pub delivered: u64,
    pub saved: u64,
    pub failures: u64,
}

/// Registry of polled chats plus the scan loop that serves them.
pub struct MessageManager {
    chats: RwLock<Vec<Arc<Chat>>>,
    history: Arc<dyn ChatHistory>,
    config: ManagerConfig,
    scans: AtomicU64,
    delivered: AtomicU64,
    saved: AtomicU64,
    failures: AtomicU64,
}

impl MessageManager {
    pub fn new(history: Arc<dyn ChatHistory>, config: ManagerConfig) -> Self {
        Self {
            chats: RwLock::new(Vec::new()),
            history,
            config,
            scans: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            saved: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Register `chat` unless a chat with the same `(chat_id, receiver_id)`
    /// exists; in that case the first match in list order is returned and the
    /// list is unchanged.
    pub async fn enqueue_chat_if_not_exists(&self, chat: Chat) -> Arc<Chat> {
        let mut chats = self.chats.write().await;
        if let Some(existing) = chats
            .iter()
            .find(|c| c.chat_id == chat.chat_id && c.receiver_id == chat.receiver_id)
        {
            return existing.clone();
        }
        let chat = Arc::new(chat);
        chats.push(chat.clone());
        info!(chat_id = %chat.chat_id, receiver_id = %chat.receiver_id, total = chats.len(), "Chat enqueued");
        chat
    }

    /// Insert `chat` at the front unconditionally.
    pub async fn enqueue_chat(&self, chat: Chat) -> Arc<Chat> {
        let chat = Arc::new(chat);
        self.chats.write().await.insert(0, chat.clone());
        chat
    }

    /// Remove every entry for `chat_id`, whatever its receiver. Returns how many went.
    pub async fn dequeue_chat(&self, chat_id: &str) -> usize {
        let mut chats = self.chats.write().await;
        let before = chats.len();
        chats.retain(|c| c.chat_id != chat_id);
        let removed = before - chats.len();
        if removed > 0 {
            info!(chat_id, removed, "Chat dequeued");
        }
        removed
    }

    /// Snapshot of the registry in list order.
    pub async fn chats(&self) -> Vec<Arc<Chat>> {
        self.chats.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.chats.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chats.read().await.is_empty()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            scans: self.scans.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Walk the registry once. Chats are served concurrently; failures are
    /// logged and counted, never propagated.
    pub async fn scan_once(&self) -> ScanReport {
        let chats = self.chats().await;
        let reports = join_all(chats.iter().map(|chat| self.poll_chat(chat))).await;
        let report = reports
            .into_iter()
            .fold(ScanReport::default(), ScanReport::merge);

        self.scans.fetch_add(1, Ordering::Relaxed);
        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.saved.fetch_add(report.saved as u64, Ordering::Relaxed);
        self.failures.fetch_add(
            (report.fetch_failures + report.save_failures) as u64,
            Ordering::Relaxed,
        );
        report
    }

    async fn poll_chat(&self, chat: &Chat) -> ScanReport {
        let mut report = ScanReport {
            chats: 1,
            ..Default::default()
        };
        let limit = self.config.fetch_timeout;

        if chat.has_connected_peer().await && chat.has_backlog_room().await {
            match timeout(
                limit,
                self.history.fetch_updates(&chat.chat_id, &chat.receiver_id),
            )
            .await
            {
                Ok(Ok(updates)) => chat.push_received(updates).await,
                Ok(Err(e)) => {
                    warn!(chat_id = %chat.chat_id, receiver_id = %chat.receiver_id, error = %e, "Failed to fetch chat updates");
                    report.fetch_failures += 1;
                }
                Err(_) => {
                    warn!(chat_id = %chat.chat_id, receiver_id = %chat.receiver_id, timeout_ms = limit.as_millis() as u64, "Timed out fetching chat updates");
                    report.fetch_failures += 1;
                }
            }
        }

        let (delivered, dropped) = chat.deliver().await;
        report.delivered = delivered;
        report.dropped = dropped;

        for message in chat.drain_pending().await {
            match timeout(limit, self.history.save(&message)).await {
                Ok(Ok(())) => report.saved += 1,
                Ok(Err(e)) => {
                    warn!(chat_id = %chat.chat_id, msg_id = %message.msg_id, error = %e, "Failed to save chat message");
                    report.save_failures += 1;
                }
                Err(_) => {
                    warn!(chat_id = %chat.chat_id, msg_id = %message.msg_id, "Timed out saving chat message");
                    report.save_failures += 1;
                }
            }
        }

        report
    }

    /// Scan on every tick until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.scan_interval.as_millis() as u64,
            "Message manager started"
        );
        let mut ticker = interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.scan_once().await;
                    if report.has_activity() {
                        debug!(?report, "scan complete");
                    }
                }
            }
        }
        info!("Message manager stopped");
    }
}
