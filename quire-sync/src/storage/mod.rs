//! Server-side tables: the append-only update log and the presence registry.
//!
//! ```text
//! ┌──────────────┐   append / upsert / delete   ┌──────────────────────────┐
//! │ HTTP handler │ ───────────────────────────► │ SyncStore                │
//! └──────┬───────┘                              │  updates  (doc, seq)     │
//!        │ publish                              │  presence (doc, client)  │
//!        ▼                                      └──────────────────────────┘
//! ┌──────────────┐   snapshot on subscribe              ▲
//! │ FeedHub      │ ─────────────────────────────────────┘
//! └──────────────┘
//! ```
//!
//! Two backends implement [`SyncStore`]: [`MemoryStore`] for tests and
//! ephemeral servers, [`RocksStore`] for durable deployments.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{ClientId, DocumentId};

/// One row of the update log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    pub doc_id: DocumentId,
    /// Insertion order within the document, starting at 1.
    pub seq: u64,
    pub payload: Vec<u8>,
}

/// The live presence row of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub doc_id: DocumentId,
    pub client_id: ClientId,
    /// Store-wide monotonically increasing change version.
    pub version: u64,
    pub updated_at_ms: u64,
    pub payload: Vec<u8>,
}

impl PresenceRecord {
    /// Whether this row has been silent for longer than `ttl` at `now_ms`.
    pub fn is_stale(&self, now_ms: u64, ttl: Duration) -> bool {
        now_ms.saturating_sub(self.updated_at_ms) > ttl.as_millis() as u64
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Backend for the update log and the presence registry.
///
/// Implementations must be safe to share between request handlers. The
/// update log is write-once: there is no operation that rewrites or removes
/// an update row.
pub trait SyncStore: Send + Sync {
    /// Append a payload to a document's log and return its sequence number.
    fn append_update(&self, doc_id: DocumentId, payload: &[u8]) -> Result<u64, StoreError>;

    /// All updates of a document with `seq > after`, in insertion order.
    fn updates_since(&self, doc_id: DocumentId, after: u64) -> Result<Vec<UpdateRecord>, StoreError>;

    /// Highest sequence number written for a document (0 when empty).
    fn last_sequence(&self, doc_id: DocumentId) -> Result<u64, StoreError>;

    /// Insert or replace the presence row of `(doc_id, client_id)`.
    fn upsert_presence(
        &self,
        doc_id: DocumentId,
        client_id: ClientId,
        payload: &[u8],
        updated_at_ms: u64,
    ) -> Result<PresenceRecord, StoreError>;

    /// Remove the presence row of `(doc_id, client_id)` and return the
    /// version assigned to the removal. Removing an absent row still yields a
    /// fresh version so the tombstone can be published.
    fn delete_presence(&self, doc_id: DocumentId, client_id: ClientId) -> Result<u64, StoreError>;

    /// Current presence rows of a document, stale ones included.
    fn presence_rows(&self, doc_id: DocumentId) -> Result<Vec<PresenceRecord>, StoreError>;

    /// Presence rows of every document silent for longer than `ttl`.
    fn stale_presence(&self, now_ms: u64, ttl: Duration) -> Result<Vec<PresenceRecord>, StoreError>;

    /// Documents with at least one update.
    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_presence_staleness_window() {
        let record = PresenceRecord {
            doc_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            version: 1,
            updated_at_ms: 10_000,
            payload: vec![1],
        };
        let ttl = Duration::from_secs(5);
        assert!(!record.is_stale(10_000, ttl));
        assert!(!record.is_stale(15_000, ttl));
        assert!(record.is_stale(15_001, ttl));
        // Clock behind the writer: never stale.
        assert!(!record.is_stale(9_000, ttl));
    }
}
