//! Client provider: keeps one local [`Replica`] in sync with the server.
//!
//! ```text
//!            open()
//!              │ load local cache
//!              ▼
//!        Initializing ──► Subscribing ──► Syncing ──UpToDate──► Live
//!                             ▲              │                   │
//!                             │   transport failure (backoff)    │
//!                             └────────── Disconnected ◄─────────┘
//!
//!        close() from any state ──► Closed (terminal)
//! ```
//!
//! Two background tasks run per provider:
//! - the sync task owns both feed subscriptions and merges what they carry
//!   into the replica and the presence map;
//! - the writer task drains the outbound queue. Local edits only enqueue, so
//!   the editing surface never waits on the network. Failed appends go to the
//!   [`OfflineQueue`] and are replayed after the next successful send.
//!
//! Besides the replica, a provider keeps a second replica holding only what
//! the log is known to contain: rows read from the feed plus appends the
//! server acknowledged. On every transition to `Live` the provider uploads the
//! difference between the two, so edits restored from the cache or dropped
//! from a previous session's queues still reach the log.
//!
//! Remote updates are merged, never re-sent: only the local edit methods and
//! the catch-up upload put anything on the outbound queue.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::cache::LocalCache;
use crate::error::SyncError;
use crate::presence::{PresenceMap, PresenceState, RemotePresence};
use crate::protocol::{ClientId, DocumentId, FeedMessage, Table};
use crate::replica::{is_empty_update, Replica};
use crate::transport::HttpTransport;

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Server root, e.g. `http://127.0.0.1:9090`
    pub server_url: String,
    /// Bearer token sent with every request
    pub session_token: Option<String>,
    /// Identity of this client in the presence registry
    pub client_id: ClientId,
    /// Name published in this client's presence
    pub display_name: String,
    /// Timeout of a single PUT
    pub request_timeout: Duration,
    /// First reconnect delay; doubles up to `max_backoff`
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How often local presence is re-published and stale peers are pruned
    pub presence_heartbeat: Duration,
    /// Peers silent for longer than this are dropped from the presence map
    pub presence_ttl: Duration,
    /// Failed updates held for replay before the queue collapses into a snapshot
    pub offline_queue_capacity: usize,
    /// Upper bound on each step of `close()`: draining the outbound queue and
    /// withdrawing presence
    pub close_timeout: Duration,
    /// Buffered `SyncEvent`s per listener
    pub event_capacity: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:9090".to_string(),
            session_token: None,
            client_id: Uuid::new_v4(),
            display_name: "Anonymous".to_string(),
            request_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            presence_heartbeat: Duration::from_secs(10),
            presence_ttl: Duration::from_secs(30),
            offline_queue_capacity: 10_000,
            close_timeout: Duration::from_secs(2),
            event_capacity: 256,
        }
    }
}

impl ProviderConfig {
    /// Short timers for tests against a local server.
    pub fn for_testing(server_url: impl Into<String>, session_token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            session_token: Some(session_token.into()),
            request_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
            presence_heartbeat: Duration::from_millis(200),
            presence_ttl: Duration::from_secs(1),
            offline_queue_capacity: 1_000,
            close_timeout: Duration::from_secs(1),
            event_capacity: 1024,
            ..Self::default()
        }
    }
}

/// Lifecycle of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderState {
    Initializing,
    Subscribing,
    Syncing,
    Live,
    Disconnected,
    Closed,
}

impl ProviderState {
    /// What the editing surface shows for this state.
    pub fn status(&self) -> ConnectionStatus {
        match self {
            ProviderState::Initializing | ProviderState::Subscribing | ProviderState::Syncing => {
                ConnectionStatus::Connecting
            }
            ProviderState::Live => ConnectionStatus::Connected,
            ProviderState::Disconnected | ProviderState::Closed => ConnectionStatus::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Events emitted by a provider.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection status changed
    Status(ConnectionStatus),
    /// A log row was merged into the replica
    RemoteUpdate { seq: u64 },
    /// A peer's presence was added or replaced
    PresenceChanged(ClientId),
    /// A peer left, was withdrawn, or went stale
    PresenceRemoved(ClientId),
    /// A non-fatal failure; the provider keeps running
    Warning(SyncError),
}

/// Updates whose append failed, held for replay.
///
/// When full, the queue collapses into a single full-state snapshot of the
/// replica, which carries everything the dropped entries did.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size: max_size.max(1),
        }
    }

    /// Queue an update for replay. Returns `false` when full.
    pub fn enqueue(&mut self, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(payload);
        true
    }

    /// Replace everything queued with one update.
    pub fn collapse(&mut self, snapshot: Vec<u8>) {
        self.queue.clear();
        self.queue.push_back(snapshot);
    }

    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    /// Put back an update that failed again; it keeps its place at the head.
    pub fn requeue_front(&mut self, payload: Vec<u8>) {
        self.queue.push_front(payload);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self { initial, max: max.max(initial), current: initial }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum Outbound {
    Update(Vec<u8>),
    Presence(Vec<u8>),
    Withdraw,
    /// Everything queued before this has been sent; the writer stops.
    Stop(oneshot::Sender<()>),
}

struct Shared {
    doc_id: DocumentId,
    config: ProviderConfig,
    transport: HttpTransport,
    cache: Arc<dyn LocalCache>,
    replica: Mutex<Replica>,
    /// What the update log is known to hold.
    log_view: Mutex<Replica>,
    presence: Mutex<PresenceMap>,
    local_presence: Mutex<Option<Vec<u8>>>,
    offline: Mutex<OfflineQueue>,
    state: watch::Sender<ProviderState>,
    events: broadcast::Sender<SyncEvent>,
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    /// Move to `next` unless already `Closed`; emits a status event when the
    /// visible status changes.
    fn set_state(&self, next: ProviderState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            if *state == ProviderState::Closed || *state == next {
                return false;
            }
            previous = *state;
            *state = next;
            true
        });
        if !changed {
            return;
        }
        log::debug!("Document {}: {:?} -> {:?}", self.doc_id, previous, next);
        if previous.status() != next.status() {
            let _ = self.events.send(SyncEvent::Status(next.status()));
        }
    }

    fn state(&self) -> ProviderState {
        *self.state.borrow()
    }

    fn warn(&self, error: SyncError) {
        log::warn!("Document {}: {error}", self.doc_id);
        let _ = self.events.send(SyncEvent::Warning(error));
    }

    fn enqueue(&self, item: Outbound) {
        // The writer only goes away on shutdown.
        let _ = self.outbound.send(item);
    }

    async fn save_snapshot(&self) {
        let snapshot = self.replica.lock().await.encode_state();
        if let Err(e) = self.cache.store(self.doc_id, &snapshot) {
            self.warn(e.into());
        }
    }

    async fn queue_offline(&self, payload: Vec<u8>) {
        if self.offline.lock().await.enqueue(payload) {
            return;
        }
        let snapshot = self.replica.lock().await.encode_state();
        self.offline.lock().await.collapse(snapshot);
        log::info!("Document {}: offline queue full, collapsed into a snapshot", self.doc_id);
    }

    /// Record an update the log now holds.
    async fn acknowledge(&self, payload: &[u8]) {
        if let Err(e) = self.log_view.lock().await.merge(payload) {
            log::debug!("Document {}: acknowledged update not tracked: {e}", self.doc_id);
        }
    }

    /// Upload whatever the replica holds that the log does not. Supersedes the
    /// offline queue, whose entries are all part of the difference.
    async fn upload_missing(&self) {
        let missing = {
            let log_view = self.log_view.lock().await;
            let replica = self.replica.lock().await;
            if replica.snapshot() == log_view.snapshot() {
                Ok(None)
            } else {
                replica.diff_since(&log_view.state_vector()).map(Some)
            }
        };
        match missing {
            Ok(missing) => {
                self.offline.lock().await.clear();
                let Some(diff) = missing.filter(|diff| !is_empty_update(diff)) else { return };
                log::info!(
                    "Document {}: uploading {} bytes the log is missing",
                    self.doc_id,
                    diff.len()
                );
                self.enqueue(Outbound::Update(diff));
            }
            Err(e) => self.warn(e),
        }
    }

    /// Replay queued updates until one fails with a transport failure.
    async fn flush_offline(&self) {
        let mut replayed = 0usize;
        loop {
            let next = self.offline.lock().await.pop_front();
            let Some(payload) = next else { break };
            match self.transport.append_update(self.doc_id, &payload).await {
                Ok(()) => {
                    self.acknowledge(&payload).await;
                    replayed += 1;
                }
                Err(e) if e.is_retryable() => {
                    self.offline.lock().await.requeue_front(payload);
                    break;
                }
                Err(e) => self.warn(e),
            }
        }
        if replayed > 0 {
            log::info!("Document {}: replayed {replayed} queued updates", self.doc_id);
        }
    }

    async fn publish_local_presence(&self) {
        if let Some(payload) = self.local_presence.lock().await.clone() {
            self.enqueue(Outbound::Presence(payload));
        }
    }

    async fn emit_pruned(&self, pruned: Vec<ClientId>) {
        for client_id in pruned {
            log::debug!("Document {}: peer {client_id} went stale", self.doc_id);
            let _ = self.events.send(SyncEvent::PresenceRemoved(client_id));
        }
    }

    /// One connection: subscribe to both feeds and process them until either
    /// fails. Only returns with an error.
    async fn session(&self, cursor: &mut u64, backoff: &mut Backoff) -> Result<(), SyncError> {
        let mut updates = self
            .transport
            .subscribe(Table::DocumentUpdates, self.doc_id, *cursor)
            .await?;
        let mut presence = self
            .transport
            .subscribe(Table::PresenceUpdates, self.doc_id, 0)
            .await?;

        // Presence is rebuilt from the new snapshot.
        let dropped: Vec<ClientId> = {
            let mut map = self.presence.lock().await;
            let ids = map.snapshot().into_iter().map(|p| p.client_id).collect();
            map.clear();
            ids
        };
        self.emit_pruned(dropped).await;
        self.set_state(ProviderState::Syncing);

        let mut heartbeat = tokio::time::interval(self.config.presence_heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                next = updates.next() => {
                    let msg = feed_item(next, Table::DocumentUpdates)?;
                    self.on_update_message(msg, cursor, backoff).await;
                }
                next = presence.next() => {
                    let msg = feed_item(next, Table::PresenceUpdates)?;
                    self.on_presence_message(msg).await;
                }
                _ = heartbeat.tick() => self.on_heartbeat().await,
            }
        }
    }

    async fn on_update_message(&self, msg: FeedMessage, cursor: &mut u64, backoff: &mut Backoff) {
        match msg {
            FeedMessage::Update { seq, payload } => {
                if seq <= *cursor {
                    return;
                }
                *cursor = seq;
                if let Err(e) = self.replica.lock().await.merge(&payload) {
                    self.warn(SyncError::InvalidPayload(format!("update {seq} not merged: {e}")));
                    return;
                }
                self.acknowledge(&payload).await;
                log::trace!("Document {}: merged update {seq}", self.doc_id);
                let _ = self.events.send(SyncEvent::RemoteUpdate { seq });
            }
            FeedMessage::UpToDate { cursor: caught_up } => {
                *cursor = (*cursor).max(caught_up);
                if self.state() != ProviderState::Live {
                    self.set_state(ProviderState::Live);
                    backoff.reset();
                    self.upload_missing().await;
                    self.publish_local_presence().await;
                    self.save_snapshot().await;
                    log::info!("Document {} is live at update {}", self.doc_id, *cursor);
                }
            }
            other => log::trace!("Ignoring {:?} on the update feed", other.table()),
        }
    }

    async fn on_presence_message(&self, msg: FeedMessage) {
        match msg {
            FeedMessage::Presence { client_id, version, payload, .. } => {
                if self.presence.lock().await.apply(client_id, version, payload) {
                    let _ = self.events.send(SyncEvent::PresenceChanged(client_id));
                }
            }
            FeedMessage::PresenceRemoved { client_id, .. } => {
                if self.presence.lock().await.remove(client_id) {
                    let _ = self.events.send(SyncEvent::PresenceRemoved(client_id));
                }
            }
            FeedMessage::UpToDate { .. } => {
                log::trace!("Document {}: presence snapshot complete", self.doc_id);
            }
            FeedMessage::Update { .. } => {}
        }
    }

    async fn on_heartbeat(&self) {
        let pruned = self.presence.lock().await.prune_stale(self.config.presence_ttl);
        self.emit_pruned(pruned).await;
        if self.state() == ProviderState::Live {
            self.publish_local_presence().await;
            self.save_snapshot().await;
        }
    }
}

/// Unwrap one feed read; a closed or broken feed is a transport failure.
fn feed_item(
    next: Option<Result<FeedMessage, SyncError>>,
    table: Table,
) -> Result<FeedMessage, SyncError> {
    match next {
        Some(Ok(msg)) => Ok(msg),
        Some(Err(e)) => Err(SyncError::TransportFailure(format!("{table} feed: {e}"))),
        None => Err(SyncError::TransportFailure(format!("{table} feed closed"))),
    }
}

/// Resolves once `shutdown` is set. The `watch::Ref` never leaves this
/// function, so callers' futures stay `Send`.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn run_sync(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut cursor = 0u64;
    let mut backoff = Backoff::new(shared.config.initial_backoff, shared.config.max_backoff);

    loop {
        shared.set_state(ProviderState::Subscribing);
        let outcome = tokio::select! {
            outcome = shared.session(&mut cursor, &mut backoff) => outcome,
            _ = stopped(&mut shutdown) => return,
        };
        let Err(error) = outcome else { continue };

        shared.set_state(ProviderState::Disconnected);
        if !error.is_retryable() {
            log::error!("Document {}: giving up on sync: {error}", shared.doc_id);
            shared.warn(error);
            return;
        }
        let delay = backoff.next_delay();
        log::info!(
            "Document {}: disconnected ({error}), retrying in {delay:?}",
            shared.doc_id
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(&mut shutdown) => return,
        }
    }
}

async fn run_writer(
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let item = tokio::select! {
            item = outbound.recv() => item,
            _ = stopped(&mut shutdown) => None,
        };
        let Some(item) = item else { break };

        match item {
            Outbound::Update(payload) => {
                match shared.transport.append_update(shared.doc_id, &payload).await {
                    Ok(()) => {
                        shared.acknowledge(&payload).await;
                        if !shared.offline.lock().await.is_empty() {
                            shared.flush_offline().await;
                        }
                    }
                    Err(e) => {
                        if e.is_retryable() {
                            shared.queue_offline(payload).await;
                        }
                        shared.warn(e);
                    }
                }
            }
            Outbound::Presence(payload) => {
                let result = shared
                    .transport
                    .upsert_presence(shared.doc_id, shared.config.client_id, &payload)
                    .await;
                if let Err(e) = result {
                    shared.warn(e);
                }
            }
            Outbound::Withdraw => {
                let result = shared
                    .transport
                    .delete_presence(shared.doc_id, shared.config.client_id)
                    .await;
                if let Err(e) = result {
                    shared.warn(e);
                }
            }
            Outbound::Stop(done) => {
                let _ = done.send(());
                break;
            }
        }
    }
    log::trace!("Document {}: writer stopped", shared.doc_id);
}

/// Keeps one document's replica in sync. See the module docs for the
/// lifecycle.
pub struct Provider {
    shared: Arc<Shared>,
    sync_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Provider {
    /// Open a provider for `doc_id`. Loads the local cache, then connects in
    /// the background; the returned provider is usable immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn open(
        doc_id: DocumentId,
        config: ProviderConfig,
        cache: Arc<dyn LocalCache>,
    ) -> Result<Self, SyncError> {
        let transport = HttpTransport::new(
            config.server_url.clone(),
            config.session_token.clone(),
            config.request_timeout,
        )?;

        let replica = match cache.load(doc_id) {
            Ok(Some(snapshot)) => match Replica::from_snapshot(&snapshot) {
                Ok(replica) => {
                    log::debug!("Document {doc_id}: restored {} bytes from cache", snapshot.len());
                    replica
                }
                Err(e) => {
                    log::warn!("Document {doc_id}: ignoring unreadable cache entry: {e}");
                    Replica::new()
                }
            },
            Ok(None) => Replica::new(),
            Err(e) => {
                log::warn!("Document {doc_id}: cache unavailable: {e}");
                Replica::new()
            }
        };

        let local_presence = PresenceState::new(config.client_id, config.display_name.clone()).encode()?;
        let (state, _) = watch::channel(ProviderState::Initializing);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            doc_id,
            presence: Mutex::new(PresenceMap::new(config.client_id)),
            offline: Mutex::new(OfflineQueue::new(config.offline_queue_capacity)),
            local_presence: Mutex::new(Some(local_presence)),
            replica: Mutex::new(replica),
            log_view: Mutex::new(Replica::new()),
            config,
            transport,
            cache,
            state,
            events,
            outbound,
            shutdown,
        });

        tokio::spawn(run_writer(shared.clone(), outbound_rx, shared.shutdown.subscribe()));
        let sync_task = tokio::spawn(run_sync(shared.clone(), shared.shutdown.subscribe()));
        log::info!("Opened provider for document {doc_id}");

        Ok(Self {
            shared,
            sync_task: std::sync::Mutex::new(Some(sync_task)),
        })
    }

    pub fn doc_id(&self) -> DocumentId {
        self.shared.doc_id
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.config.client_id
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.state() == ProviderState::Closed {
            return Err(SyncError::TransportFailure("provider is closed".into()));
        }
        Ok(())
    }

    /// Insert `chunk` at character `index` and ship the edit.
    pub async fn insert_text(&self, index: u32, chunk: &str) -> Result<(), SyncError> {
        self.ensure_open()?;
        let delta = self.shared.replica.lock().await.insert(index, chunk)?;
        if let Some(delta) = delta {
            self.shared.enqueue(Outbound::Update(delta));
        }
        Ok(())
    }

    /// Append `chunk` at the end of the text and ship the edit.
    pub async fn push_text(&self, chunk: &str) -> Result<(), SyncError> {
        self.ensure_open()?;
        let delta = self.shared.replica.lock().await.push(chunk)?;
        if let Some(delta) = delta {
            self.shared.enqueue(Outbound::Update(delta));
        }
        Ok(())
    }

    /// Remove `len` characters at `index` and ship the edit.
    pub async fn remove_text(&self, index: u32, len: u32) -> Result<(), SyncError> {
        self.ensure_open()?;
        let delta = self.shared.replica.lock().await.remove(index, len)?;
        if let Some(delta) = delta {
            self.shared.enqueue(Outbound::Update(delta));
        }
        Ok(())
    }

    /// Merge an update produced by a local editor binding and ship it.
    pub async fn apply_local_update(&self, update: &[u8]) -> Result<(), SyncError> {
        self.ensure_open()?;
        self.shared.replica.lock().await.merge(update)?;
        self.shared.enqueue(Outbound::Update(update.to_vec()));
        Ok(())
    }

    pub async fn text(&self) -> String {
        self.shared.replica.lock().await.text()
    }

    pub async fn state_vector(&self) -> Vec<u8> {
        self.shared.replica.lock().await.state_vector()
    }

    pub async fn encode_state(&self) -> Vec<u8> {
        self.shared.replica.lock().await.encode_state()
    }

    /// Publish this client's presence. Sent now when live, otherwise on the
    /// next transition to `Live`.
    pub async fn set_presence(&self, state: &PresenceState) -> Result<(), SyncError> {
        self.set_presence_bytes(state.encode()?).await
    }

    /// Publish an opaque presence payload.
    pub async fn set_presence_bytes(&self, payload: Vec<u8>) -> Result<(), SyncError> {
        self.ensure_open()?;
        if payload.is_empty() {
            return Err(SyncError::InvalidPayload("empty presence payload".into()));
        }
        *self.shared.local_presence.lock().await = Some(payload.clone());
        if self.state() == ProviderState::Live {
            self.shared.enqueue(Outbound::Presence(payload));
        }
        Ok(())
    }

    /// Stop publishing presence and withdraw the current row.
    pub async fn clear_presence(&self) -> Result<(), SyncError> {
        self.ensure_open()?;
        *self.shared.local_presence.lock().await = None;
        self.shared.enqueue(Outbound::Withdraw);
        Ok(())
    }

    /// Remote peers currently present.
    pub async fn remote_presence(&self) -> Vec<RemotePresence> {
        self.shared.presence.lock().await.snapshot()
    }

    pub fn state(&self) -> ProviderState {
        self.shared.state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().status()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProviderState> {
        self.shared.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the provider reaches `target`. Returns `false` on timeout.
    pub async fn wait_for_state(&self, target: ProviderState, within: Duration) -> bool {
        let mut state = self.shared.state.subscribe();
        let reached = async move { state.wait_for(|s| *s == target).await.is_ok() };
        tokio::time::timeout(within, reached).await.unwrap_or(false)
    }

    pub async fn offline_len(&self) -> usize {
        self.shared.offline.lock().await.len()
    }

    /// Close the provider: send what is already queued, cancel both feeds,
    /// withdraw presence (best effort), snapshot into the local cache. Each
    /// network step is bounded by `close_timeout`.
    ///
    /// Edits that could not be sent stay in the cached snapshot and are
    /// uploaded the next time a provider for this document goes live.
    pub async fn close(&self) {
        if self.state() == ProviderState::Closed {
            return;
        }
        let (drained, done) = oneshot::channel();
        self.shared.enqueue(Outbound::Stop(drained));
        match tokio::time::timeout(self.shared.config.close_timeout, done).await {
            Ok(Ok(())) => log::debug!("Document {}: outbound queue drained", self.shared.doc_id),
            Ok(Err(_)) => {}
            Err(_) => log::warn!("Document {}: outbound queue not drained in time", self.shared.doc_id),
        }

        self.shared.shutdown.send_replace(true);
        let sync_task = self
            .sync_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = sync_task {
            let _ = task.await;
        }

        let shared = &self.shared;
        let withdraw = shared.transport.delete_presence(shared.doc_id, shared.config.client_id);
        match tokio::time::timeout(shared.config.close_timeout, withdraw).await {
            Ok(Ok(())) => log::debug!("Document {}: presence withdrawn", shared.doc_id),
            Ok(Err(e)) => log::debug!("Document {}: presence withdrawal failed: {e}", shared.doc_id),
            Err(_) => log::debug!("Document {}: presence withdrawal timed out", shared.doc_id),
        }

        shared.save_snapshot().await;
        shared.set_state(ProviderState::Closed);
        log::info!("Closed provider for document {}", shared.doc_id);
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        if self.state() == ProviderState::Closed {
            return;
        }
        self.shared.shutdown.send_replace(true);
        self.shared.set_state(ProviderState::Closed);
        // Best-effort tombstone; the server's staleness sweep covers failure.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let transport = self.shared.transport.clone();
            let (doc_id, client_id) = (self.shared.doc_id, self.shared.config.client_id);
            handle.spawn(async move {
                let _ = transport.delete_presence(doc_id, client_id).await;
            });
        }
    }
}
