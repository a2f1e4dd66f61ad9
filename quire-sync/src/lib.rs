//! # quire-sync — multi-user document sync
//!
//! Every client holds a full CRDT replica of each open document. The server
//! never interprets document content: it keeps an append-only log of opaque
//! updates and a registry of presence rows, and streams both to subscribers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  PUT /document-updates   ┌──────────────┐
//! │ Provider     │  PUT /presence-updates   │ SyncServer   │
//! │ (per doc)    │ ───────────────────────► │ (axum)       │
//! │              │                          │   auth gate  │
//! │              │  GET /replication/{tbl}  │              │
//! │              │ ◄──────────────────────► │              │
//! └──────┬───────┘    WebSocket feed        └──────┬───────┘
//!        │                                         │
//!        ▼                                         ▼
//! ┌──────────────┐                          ┌──────────────┐
//! │ Replica      │                          │ FeedHub      │
//! │ (yrs Doc)    │                          │ (fan-out)    │
//! └──────┬───────┘                          └──────┬───────┘
//!        │                                         │
//!        ▼                                         ▼
//! ┌──────────────┐                          ┌──────────────┐
//! │ LocalCache   │                          │ SyncStore    │
//! │ (snapshot)   │                          │ log+presence │
//! └──────────────┘                          └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — feed frames and table names
//! - [`error`] — the error taxonomy shared by both sides
//! - [`auth`] — authentication and document membership
//! - [`storage`] — update log and presence registry backends
//! - [`feed`] — per-document change feeds
//! - [`server`] — HTTP and WebSocket endpoints
//! - [`transport`] — client side of the wire
//! - [`replica`] — the local CRDT document
//! - [`presence`] — presence payloads and the remote presence map
//! - [`cache`] — durable local snapshots
//! - [`provider`] — client state machine
//! - [`arena`] — one provider per open document

pub mod arena;
pub mod auth;
pub mod cache;
pub mod error;
pub mod feed;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod replica;
pub mod server;
pub mod storage;
pub mod transport;

pub use arena::ReplicaArena;
pub use auth::{AccessControl, AccessTable, Principal, ScopeId, StaticAccessControl};
pub use cache::{CacheError, LocalCache, MemoryCache, RocksCache};
pub use error::SyncError;
pub use feed::{FeedHub, HubStats, Subscription};
pub use presence::{CursorColor, PresenceMap, PresenceState, RemotePresence, TextCursor};
pub use protocol::{ClientId, DocumentId, FeedMessage, ProtocolError, Table};
pub use provider::{
    Backoff, ConnectionStatus, OfflineQueue, Provider, ProviderConfig, ProviderState, SyncEvent,
};
pub use replica::Replica;
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    MemoryStore, PresenceRecord, RocksStore, StoreConfig, StoreError, SyncStore, UpdateRecord,
};
pub use transport::{FeedStream, HttpTransport};
