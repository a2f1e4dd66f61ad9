//! HTTP surface of the sync engine.
//!
//! Architecture:
//! ```text
//! PUT /document-updates?documentId=…          ──┐
//! PUT /presence-updates?documentId=…&clientId=… ─┼─► auth gate ─► FeedHub ─► SyncStore
//! GET /replication/{table}?documentId=…&offset=… ┘                  │
//!                                                                    ▼
//!                                     WebSocket: snapshot, UpToDate, live rows
//! ```
//!
//! Every request runs the same gate before touching storage:
//! authenticate (401), parse ids (400), resolve the owning scope (404), check
//! membership (403). Feed subscriptions run it on every (re)connect, so a
//! revoked member is cut off at their next reconnect.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, put};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use uuid::Uuid;

use crate::auth::{authenticate, authorize_document, AccessControl};
use crate::error::SyncError;
use crate::feed::{FeedHub, HubStats, Subscription};
use crate::protocol::{DocumentId, Table, CLIENT_ID_PARAM, DOCUMENT_ID_PARAM, OFFSET_PARAM};
use crate::storage::{MemoryStore, RocksStore, StoreConfig, SyncStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory tables)
    pub storage_path: Option<PathBuf>,
    /// Live rows a feed subscriber may fall behind before it is evicted
    pub broadcast_capacity: usize,
    /// Presence rows older than this are hidden from snapshots and swept
    pub presence_ttl: Duration,
    /// How often stale presence and idle feeds are cleaned up
    pub sweep_interval: Duration,
    /// Largest accepted PUT body
    pub max_payload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            broadcast_capacity: 256,
            presence_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            max_payload_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory tables, fast sweeps.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_path: None,
            broadcast_capacity: 256,
            presence_ttl: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(100),
            max_payload_bytes: 1024 * 1024,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub updates_appended: u64,
    pub presence_upserts: u64,
    pub presence_deletes: u64,
    pub total_subscriptions: u64,
    pub active_subscriptions: u64,
    pub rejected_requests: u64,
    pub feeds: HubStats,
}

#[derive(Default)]
struct AtomicServerStats {
    updates_appended: AtomicU64,
    presence_upserts: AtomicU64,
    presence_deletes: AtomicU64,
    total_subscriptions: AtomicU64,
    active_subscriptions: AtomicU64,
    rejected_requests: AtomicU64,
}

/// Shared handler state.
#[derive(Clone)]
struct AppState {
    hub: Arc<FeedHub>,
    access: Arc<dyn AccessControl>,
    stats: Arc<AtomicServerStats>,
    shutdown: watch::Receiver<bool>,
}

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    state: AppState,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig, access: Arc<dyn AccessControl>) -> Result<Self, SyncError> {
        let store: Arc<dyn SyncStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksStore::open(store_config)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store, access))
    }

    /// Create a server over an existing store.
    pub fn with_store(
        config: ServerConfig,
        store: Arc<dyn SyncStore>,
        access: Arc<dyn AccessControl>,
    ) -> Self {
        let hub = Arc::new(FeedHub::new(store, config.broadcast_capacity, config.presence_ttl));
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            state: AppState {
                hub,
                access,
                stats: Arc::new(AtomicServerStats::default()),
                shutdown: shutdown_rx,
            },
            config,
            shutdown: Arc::new(shutdown),
        }
    }

    /// The axum router with all three endpoints.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/document-updates", put(put_document_update))
            .route("/presence-updates", put(put_presence_update))
            .route("/replication/{table}", get(replication))
            .layer(DefaultBodyLimit::max(self.config.max_payload_bytes))
            .with_state(self.state.clone())
    }

    /// Bind `config.bind_addr` and serve until [`SyncServer::shutdown`].
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await?;
        Ok(())
    }

    /// Serve on an already bound listener until [`SyncServer::shutdown`].
    ///
    /// Open feed sockets are closed on shutdown so the call returns once the
    /// last one is gone.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        log::info!("Sync server listening on {addr}");

        let sweeper = tokio::spawn(sweep_loop(
            self.state.hub.clone(),
            self.config.sweep_interval,
            self.state.shutdown.clone(),
        ));

        let mut shutdown = self.state.shutdown.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { stopped(&mut shutdown).await })
            .await;

        sweeper.abort();
        log::info!("Sync server on {addr} stopped");
        result
    }

    /// Stop accepting requests and close every open feed.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn hub(&self) -> &Arc<FeedHub> {
        &self.state.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn stats(&self) -> ServerStats {
        let s = &self.state.stats;
        ServerStats {
            updates_appended: s.updates_appended.load(Ordering::Relaxed),
            presence_upserts: s.presence_upserts.load(Ordering::Relaxed),
            presence_deletes: s.presence_deletes.load(Ordering::Relaxed),
            total_subscriptions: s.total_subscriptions.load(Ordering::Relaxed),
            active_subscriptions: s.active_subscriptions.load(Ordering::Relaxed),
            rejected_requests: s.rejected_requests.load(Ordering::Relaxed),
            feeds: self.state.hub.stats().await,
        }
    }
}

/// Resolves once `shutdown` is set. The `watch::Ref` never leaves this
/// function, so handler futures holding the call stay `Send`.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn sweep_loop(hub: Arc<FeedHub>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped(&mut shutdown) => return,
        }
        match hub.sweep_stale_presence().await {
            Ok(0) => {}
            Ok(n) => log::debug!("Swept {n} stale presence rows"),
            Err(e) => log::error!("Presence sweep failed: {e}"),
        }
        let dropped = hub.remove_idle().await;
        if dropped > 0 {
            log::trace!("Dropped {dropped} idle feeds");
        }
    }
}

fn required_uuid(params: &HashMap<String, String>, name: &str) -> Result<Uuid, SyncError> {
    let raw = params
        .get(name)
        .ok_or_else(|| SyncError::InvalidPayload(format!("missing {name}")))?;
    Uuid::parse_str(raw).map_err(|_| SyncError::InvalidPayload(format!("{name} is not a uuid: {raw}")))
}

fn offset_param(params: &HashMap<String, String>) -> Result<u64, SyncError> {
    match params.get(OFFSET_PARAM) {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| SyncError::InvalidPayload(format!("{OFFSET_PARAM} is not a number: {raw}"))),
    }
}

/// Authenticate the caller and authorize them for the document named in the
/// query string.
fn gate(state: &AppState, headers: &HeaderMap, params: &HashMap<String, String>) -> Result<DocumentId, SyncError> {
    let result = authenticate(state.access.as_ref(), headers).and_then(|principal| {
        let doc_id = required_uuid(params, DOCUMENT_ID_PARAM)?;
        authorize_document(state.access.as_ref(), &principal, doc_id)?;
        Ok(doc_id)
    });
    if let Err(e) = &result {
        state.stats.rejected_requests.fetch_add(1, Ordering::Relaxed);
        log::debug!("Rejected request: {e}");
    }
    result
}

async fn put_document_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<StatusCode, SyncError> {
    let doc_id = gate(&state, &headers, &params)?;
    if body.is_empty() {
        return Err(SyncError::InvalidPayload("empty update".into()));
    }
    let seq = state.hub.append_update(doc_id, &body).await?;
    state.stats.updates_appended.fetch_add(1, Ordering::Relaxed);
    log::trace!("Appended update {seq} ({} bytes) to document {doc_id}", body.len());
    Ok(StatusCode::NO_CONTENT)
}

/// Upsert, or withdraw when the body is empty.
async fn put_presence_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<StatusCode, SyncError> {
    let doc_id = gate(&state, &headers, &params)?;
    let client_id = required_uuid(&params, CLIENT_ID_PARAM)?;
    if body.is_empty() {
        state.hub.delete_presence(doc_id, client_id).await?;
        state.stats.presence_deletes.fetch_add(1, Ordering::Relaxed);
        log::debug!("Client {client_id} left document {doc_id}");
    } else {
        state.hub.upsert_presence(doc_id, client_id, &body).await?;
        state.stats.presence_upserts.fetch_add(1, Ordering::Relaxed);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn replication(
    State(state): State<AppState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, SyncError> {
    let doc_id = gate(&state, &headers, &params)?;
    let table = Table::parse(&table)?;
    let offset = offset_param(&params)?;
    let upgrade = upgrade
        .map_err(|e| SyncError::InvalidPayload(format!("replication requires a websocket: {e}")))?;

    let subscription = state.hub.subscribe(doc_id, table, offset).await?;
    Ok(upgrade.on_upgrade(move |socket| stream_feed(socket, subscription, state)))
}

async fn stream_feed(socket: WebSocket, mut subscription: Subscription, state: AppState) {
    state.stats.total_subscriptions.fetch_add(1, Ordering::Relaxed);
    state.stats.active_subscriptions.fetch_add(1, Ordering::Relaxed);
    log::debug!(
        "Feed {} opened for document {}",
        subscription.table(),
        subscription.doc_id()
    );

    let (mut sender, mut receiver) = socket.split();
    let mut shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            next = subscription.next() => {
                let Some(msg) = next else { break };
                let frame = match msg.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("Failed to encode feed message: {e}");
                        break;
                    }
                };
                if sender.send(Message::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = stopped(&mut shutdown) => break,
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    state.stats.active_subscriptions.fetch_sub(1, Ordering::Relaxed);
    log::debug!(
        "Feed {} closed for document {} at cursor {}",
        subscription.table(),
        subscription.doc_id(),
        subscription.cursor()
    );
}

/// Start a server on an ephemeral local port. Returns its address and the
/// task serving it.
pub async fn spawn_local(
    server: SyncServer,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<std::io::Result<()>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move { server.serve(listener).await });
    Ok((addr, handle))
}
