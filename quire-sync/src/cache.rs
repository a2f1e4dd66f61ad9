//! Local durable cache of replica snapshots.
//!
//! A snapshot lets a reopened document render before the update log has been
//! replayed. It is never authoritative: the provider always resubscribes and
//! merges the log on top of whatever the cache returned.

use rocksdb::{Options, DB};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use crate::protocol::DocumentId;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Database(String),
    #[error("cache compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for CacheError {
    fn from(e: rocksdb::Error) -> Self {
        CacheError::Database(e.to_string())
    }
}

/// Persist bytes under a document key and return them on request.
pub trait LocalCache: Send + Sync {
    fn load(&self, doc_id: DocumentId) -> Result<Option<Vec<u8>>, CacheError>;
    fn store(&self, doc_id: DocumentId, snapshot: &[u8]) -> Result<(), CacheError>;
    fn remove(&self, doc_id: DocumentId) -> Result<(), CacheError>;
}

/// Process-local cache; survives provider reopen, not process restart.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<DocumentId, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalCache for MemoryCache {
    fn load(&self, doc_id: DocumentId) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&doc_id)
            .cloned())
    }

    fn store(&self, doc_id: DocumentId, snapshot: &[u8]) -> Result<(), CacheError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(doc_id, snapshot.to_vec());
        Ok(())
    }

    fn remove(&self, doc_id: DocumentId) -> Result<(), CacheError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&doc_id);
        Ok(())
    }
}

/// RocksDB-backed cache; snapshots are LZ4 compressed.
pub struct RocksCache {
    db: DB,
    path: PathBuf,
}

impl RocksCache {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_keep_log_file_num(2);
        let db = DB::open(&opts, &path)?;
        log::debug!("Opened replica cache at {}", path.display());
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LocalCache for RocksCache {
    fn load(&self, doc_id: DocumentId) -> Result<Option<Vec<u8>>, CacheError> {
        match self.db.get(doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| CacheError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn store(&self, doc_id: DocumentId, snapshot: &[u8]) -> Result<(), CacheError> {
        let compressed = lz4_flex::compress_prepend_size(snapshot);
        self.db.put(doc_id.as_bytes(), compressed)?;
        Ok(())
    }

    fn remove(&self, doc_id: DocumentId) -> Result<(), CacheError> {
        self.db.delete(doc_id.as_bytes())?;
        Ok(())
    }
}
