//! In-memory tables. Nothing survives a restart.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use super::{PresenceRecord, StoreError, SyncStore, UpdateRecord};
use crate::protocol::{ClientId, DocumentId};

#[derive(Default)]
struct Tables {
    updates: HashMap<DocumentId, Vec<Vec<u8>>>,
    presence: HashMap<DocumentId, HashMap<ClientId, PresenceRecord>>,
    presence_version: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SyncStore for MemoryStore {
    fn append_update(&self, doc_id: DocumentId, payload: &[u8]) -> Result<u64, StoreError> {
        let mut tables = self.write();
        let log = tables.updates.entry(doc_id).or_default();
        log.push(payload.to_vec());
        Ok(log.len() as u64)
    }

    fn updates_since(&self, doc_id: DocumentId, after: u64) -> Result<Vec<UpdateRecord>, StoreError> {
        let tables = self.read();
        let Some(log) = tables.updates.get(&doc_id) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .enumerate()
            .skip(after.min(log.len() as u64) as usize)
            .map(|(i, payload)| UpdateRecord {
                doc_id,
                seq: i as u64 + 1,
                payload: payload.clone(),
            })
            .collect())
    }

    fn last_sequence(&self, doc_id: DocumentId) -> Result<u64, StoreError> {
        Ok(self.read().updates.get(&doc_id).map_or(0, |log| log.len() as u64))
    }

    fn upsert_presence(
        &self,
        doc_id: DocumentId,
        client_id: ClientId,
        payload: &[u8],
        updated_at_ms: u64,
    ) -> Result<PresenceRecord, StoreError> {
        let mut tables = self.write();
        tables.presence_version += 1;
        let record = PresenceRecord {
            doc_id,
            client_id,
            version: tables.presence_version,
            updated_at_ms,
            payload: payload.to_vec(),
        };
        tables
            .presence
            .entry(doc_id)
            .or_default()
            .insert(client_id, record.clone());
        Ok(record)
    }

    fn delete_presence(&self, doc_id: DocumentId, client_id: ClientId) -> Result<u64, StoreError> {
        let mut tables = self.write();
        tables.presence_version += 1;
        let version = tables.presence_version;
        if let Some(rows) = tables.presence.get_mut(&doc_id) {
            rows.remove(&client_id);
            if rows.is_empty() {
                tables.presence.remove(&doc_id);
            }
        }
        Ok(version)
    }

    fn presence_rows(&self, doc_id: DocumentId) -> Result<Vec<PresenceRecord>, StoreError> {
        let tables = self.read();
        let mut rows: Vec<PresenceRecord> = tables
            .presence
            .get(&doc_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| r.version);
        Ok(rows)
    }

    fn stale_presence(&self, now_ms: u64, ttl: Duration) -> Result<Vec<PresenceRecord>, StoreError> {
        let tables = self.read();
        Ok(tables
            .presence
            .values()
            .flat_map(|rows| rows.values())
            .filter(|r| r.is_stale(now_ms, ttl))
            .cloned()
            .collect())
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        Ok(self.read().updates.keys().copied().collect())
    }
}
