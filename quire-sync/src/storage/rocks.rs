//! RocksDB-backed update log and presence registry.
//!
//! Column families:
//! - `updates`  — update payloads (LZ4 compressed), keyed `doc_id ‖ seq (BE)`
//! - `presence` — bincode [`PresenceRecord`]s, keyed `doc_id ‖ client_id`
//! - `metadata` — last sequence per document (keyed by `doc_id`) and the
//!   store-wide presence version counter
//!
//! Big-endian sequence keys make a forward prefix scan return a document's
//! log in insertion order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use super::{PresenceRecord, StoreError, SyncStore, UpdateRecord};
use crate::protocol::{ClientId, DocumentId};

const CF_UPDATES: &str = "updates";
const CF_PRESENCE: &str = "presence";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_UPDATES, CF_PRESENCE, CF_METADATA];

/// Metadata key of the presence version counter. Document keys are exactly
/// 16 bytes; this one must never be.
const PRESENCE_VERSION_KEY: &[u8] = b"\0presence_version";
const _: () = assert!(PRESENCE_VERSION_KEY.len() != 16);

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Counters that must be read-modify-written atomically with their rows.
struct Counters {
    /// Last sequence per document, loaded lazily from `metadata`.
    sequences: HashMap<DocumentId, u64>,
    presence_version: u64,
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    counters: Mutex<Counters>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let presence_version = Self::read_u64(&db, CF_METADATA, PRESENCE_VERSION_KEY)?;
        log::info!(
            "Opened update store at {} (presence version {presence_version})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            counters: Mutex::new(Counters {
                sequences: HashMap::new(),
                presence_version,
            }),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_UPDATES => {
                // Payloads are LZ4-compressed before they get here.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_PRESENCE => {
                // Small, overwritten constantly, fully scanned by the sweeper.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn read_u64(
        db: &DBWithThreadMode<SingleThreaded>,
        cf_name: &str,
        key: &[u8],
    ) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::Database(format!("column family '{cf_name}' not found")))?;
        match db.get_cf(cf, key)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    fn sequence_of(&self, counters: &mut Counters, doc_id: DocumentId) -> Result<u64, StoreError> {
        if let Some(seq) = counters.sequences.get(&doc_id) {
            return Ok(*seq);
        }
        let seq = Self::read_u64(&self.db, CF_METADATA, doc_id.as_bytes())?;
        counters.sequences.insert(doc_id, seq);
        Ok(seq)
    }

    fn update_key(doc_id: DocumentId, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn presence_key(doc_id: DocumentId, client_id: ClientId) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(client_id.as_bytes());
        key
    }

    fn decode_presence(bytes: &[u8]) -> Result<PresenceRecord, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

impl SyncStore for RocksStore {
    fn append_update(&self, doc_id: DocumentId, payload: &[u8]) -> Result<u64, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let compressed = lz4_flex::compress_prepend_size(payload);

        let mut counters = self.counters();
        let seq = self.sequence_of(&mut counters, doc_id)? + 1;

        // Row and sequence land in one atomic batch.
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_updates, Self::update_key(doc_id, seq), &compressed);
        batch.put_cf(cf_meta, doc_id.as_bytes(), seq.to_be_bytes());
        self.db.write_opt(batch, &self.write_opts())?;

        counters.sequences.insert(doc_id, seq);
        Ok(seq)
    }

    fn updates_since(&self, doc_id: DocumentId, after: u64) -> Result<Vec<UpdateRecord>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let start_key = Self::update_key(doc_id, after.saturating_add(1));

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let seq = decode_u64(&key[16..24])?;
            let payload = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            records.push(UpdateRecord { doc_id, seq, payload });
        }

        Ok(records)
    }

    fn last_sequence(&self, doc_id: DocumentId) -> Result<u64, StoreError> {
        let mut counters = self.counters();
        self.sequence_of(&mut counters, doc_id)
    }

    fn upsert_presence(
        &self,
        doc_id: DocumentId,
        client_id: ClientId,
        payload: &[u8],
        updated_at_ms: u64,
    ) -> Result<PresenceRecord, StoreError> {
        let cf_presence = self.cf(CF_PRESENCE)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut counters = self.counters();
        let version = counters.presence_version + 1;
        let record = PresenceRecord {
            doc_id,
            client_id,
            version,
            updated_at_ms,
            payload: payload.to_vec(),
        };
        let encoded = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_presence, Self::presence_key(doc_id, client_id), &encoded);
        batch.put_cf(cf_meta, PRESENCE_VERSION_KEY, version.to_be_bytes());
        self.db.write_opt(batch, &self.write_opts())?;

        counters.presence_version = version;
        Ok(record)
    }

    fn delete_presence(&self, doc_id: DocumentId, client_id: ClientId) -> Result<u64, StoreError> {
        let cf_presence = self.cf(CF_PRESENCE)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut counters = self.counters();
        let version = counters.presence_version + 1;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_presence, Self::presence_key(doc_id, client_id));
        batch.put_cf(cf_meta, PRESENCE_VERSION_KEY, version.to_be_bytes());
        self.db.write_opt(batch, &self.write_opts())?;

        counters.presence_version = version;
        Ok(version)
    }

    fn presence_rows(&self, doc_id: DocumentId) -> Result<Vec<PresenceRecord>, StoreError> {
        let cf = self.cf(CF_PRESENCE)?;
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(doc_id.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != 32 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            rows.push(Self::decode_presence(&value)?);
        }
        rows.sort_by_key(|r| r.version);
        Ok(rows)
    }

    fn stale_presence(&self, now_ms: u64, ttl: Duration) -> Result<Vec<PresenceRecord>, StoreError> {
        let cf = self.cf(CF_PRESENCE)?;
        let mut stale = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let record = Self::decode_presence(&value)?;
            if record.is_stale(now_ms, ttl) {
                stale.push(record);
            }
        }
        Ok(stale)
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Ok(bytes) = <[u8; 16]>::try_from(&key[..]) {
                doc_ids.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(doc_ids)
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Deserialization(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(buf))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(path: &Path) -> RocksStore {
        RocksStore::open(StoreConfig::for_testing(path)).unwrap()
    }

    #[test]
    fn test_store_open() {
        let dir = tempdir().unwrap();
        let store = open(&dir.path().join("db"));
        assert!(store.path().exists());
        assert!(store.list_documents().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_read_in_order() {
        let dir = tempdir().unwrap();
        let store = open(&dir.path().join("db"));
        let doc = Uuid::new_v4();

        for i in 0..300u32 {
            let seq = store.append_update(doc, &i.to_le_bytes()).unwrap();
            assert_eq!(seq, i as u64 + 1);
        }

        let all = store.updates_since(doc, 0).unwrap();
        assert_eq!(all.len(), 300);
        // Sequence 256 sorts after 255 only because keys are big-endian.
        for (i, record) in all.iter().enumerate() {
            assert_eq!(record.seq, i as u64 + 1);
            assert_eq!(record.payload, (i as u32).to_le_bytes());
        }

        let tail = store.updates_since(doc, 298).unwrap();
        assert_eq!(tail.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![299, 300]);
    }

    #[test]
    fn test_documents_isolated() {
        let dir = tempdir().unwrap();
        let store = open(&dir.path().join("db"));
        let (d1, d2) = (Uuid::new_v4(), Uuid::new_v4());

        store.append_update(d1, b"first").unwrap();
        store.append_update(d2, b"second").unwrap();
        store.append_update(d1, b"third").unwrap();

        assert_eq!(store.updates_since(d1, 0).unwrap().len(), 2);
        assert_eq!(store.updates_since(d2, 0).unwrap().len(), 1);
        assert_eq!(store.list_documents().unwrap().len(), 2);
    }

    #[test]
    fn test_sequences_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let doc = Uuid::new_v4();
        {
            let store = open(&path);
            store.append_update(doc, b"a").unwrap();
            store.append_update(doc, b"b").unwrap();
            store.upsert_presence(doc, Uuid::new_v4(), b"p", 1).unwrap();
        }

        let store = open(&path);
        assert_eq!(store.last_sequence(doc).unwrap(), 2);
        assert_eq!(store.append_update(doc, b"c").unwrap(), 3);
        let payloads: Vec<Vec<u8>> = store
            .updates_since(doc, 0)
            .unwrap()
            .into_iter()
            .map(|r| r.payload)
            .collect();
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        // Presence versions keep increasing across restarts.
        let record = store.upsert_presence(doc, Uuid::new_v4(), b"q", 2).unwrap();
        assert_eq!(record.version, 2);
    }

    #[test]
    fn test_presence_upsert_delete() {
        let dir = tempdir().unwrap();
        let store = open(&dir.path().join("db"));
        let doc = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        store.upsert_presence(doc, a, b"a1", 10).unwrap();
        store.upsert_presence(doc, b, b"b1", 10).unwrap();
        store.upsert_presence(doc, a, b"a2", 20).unwrap();

        let rows = store.presence_rows(doc).unwrap();
        assert_eq!(rows.len(), 2);
        let row_a = rows.iter().find(|r| r.client_id == a).unwrap();
        assert_eq!(row_a.payload, b"a2");

        let tombstone = store.delete_presence(doc, a).unwrap();
        assert!(tombstone > row_a.version);
        let rows = store.presence_rows(doc).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].client_id, b);

        // Another document's rows never leak into this scan.
        store.upsert_presence(Uuid::new_v4(), a, b"elsewhere", 10).unwrap();
        assert_eq!(store.presence_rows(doc).unwrap().len(), 1);
    }

    #[test]
    fn test_presence_counter_is_not_listed_as_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let doc = Uuid::new_v4();
        {
            let store = open(&path);
            store.append_update(doc, b"only document").unwrap();
            store.upsert_presence(Uuid::new_v4(), Uuid::new_v4(), b"here", 10).unwrap();
            assert_eq!(store.list_documents().unwrap(), vec![doc]);
        }

        let store = open(&path);
        assert_eq!(store.list_documents().unwrap(), vec![doc]);
    }

    #[test]
    fn test_stale_presence_scan() {
        let dir = tempdir().unwrap();
        let store = open(&dir.path().join("db"));
        let doc = Uuid::new_v4();
        let (old, fresh) = (Uuid::new_v4(), Uuid::new_v4());
        store.upsert_presence(doc, old, b"old", 1_000).unwrap();
        store.upsert_presence(doc, fresh, b"fresh", 9_500).unwrap();

        let stale = store.stale_presence(10_000, Duration::from_secs(1)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].client_id, old);
    }

    #[test]
    fn test_compressible_payload_roundtrip() {
        let dir = tempdir().unwrap();
        let store = open(&dir.path().join("db"));
        let doc = Uuid::new_v4();
        let payload = "The quick brown fox jumps over the lazy dog. ".repeat(2_000).into_bytes();

        store.append_update(doc, &payload).unwrap();
        assert_eq!(store.updates_since(doc, 0).unwrap()[0].payload, payload);
    }

    #[test]
    fn test_decode_u64_rejects_short_input() {
        assert!(decode_u64(&[1, 2, 3]).is_err());
        assert_eq!(decode_u64(&7u64.to_be_bytes()).unwrap(), 7);
    }
}
