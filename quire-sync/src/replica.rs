//! One process's copy of a document: a yrs `Doc` with a single root text.
//!
//! Local edits return the encoded delta they produced so the caller can ship
//! it; remote deltas come in through [`Replica::merge`] and never produce
//! outbound traffic. Merging is idempotent and order-independent, so the same
//! bytes may arrive any number of times, in any order.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, Snapshot, StateVector, Text, Transact, TransactionMut, Update, WriteTxn};

use crate::error::SyncError;

/// Name of the root text type holding the document body.
pub const CONTENT: &str = "content";

/// Encoding of an update carrying no blocks and an empty delete set.
const EMPTY_UPDATE_V1: [u8; 2] = [0, 0];

/// Whether `update` is an encoded no-op.
pub fn is_empty_update(update: &[u8]) -> bool {
    update.is_empty() || update == EMPTY_UPDATE_V1
}

pub struct Replica {
    doc: Doc,
}

impl Replica {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Rebuild a replica from a snapshot produced by [`Replica::encode_state`].
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, SyncError> {
        let mut replica = Self::new();
        replica.merge(snapshot)?;
        Ok(replica)
    }

    /// Insert `chunk` at character `index`.
    ///
    /// Returns the delta to ship, or `None` when the edit changed nothing.
    pub fn insert(&mut self, index: u32, chunk: &str) -> Result<Option<Vec<u8>>, SyncError> {
        if chunk.is_empty() {
            return Ok(None);
        }
        let len = self.len();
        if index > len {
            return Err(SyncError::InvalidPayload(format!(
                "insert at {index} past end of text ({len})"
            )));
        }
        Ok(self.local_change(|txn| {
            let text = txn.get_or_insert_text(CONTENT);
            text.insert(txn, index, chunk);
        }))
    }

    /// Append `chunk` at the end of the text.
    pub fn push(&mut self, chunk: &str) -> Result<Option<Vec<u8>>, SyncError> {
        let len = self.len();
        self.insert(len, chunk)
    }

    /// Remove `len` characters starting at `index`.
    pub fn remove(&mut self, index: u32, len: u32) -> Result<Option<Vec<u8>>, SyncError> {
        if len == 0 {
            return Ok(None);
        }
        let total = self.len();
        if index.checked_add(len).map_or(true, |end| end > total) {
            return Err(SyncError::InvalidPayload(format!(
                "remove {len} at {index} past end of text ({total})"
            )));
        }
        Ok(self.local_change(|txn| {
            let text = txn.get_or_insert_text(CONTENT);
            text.remove_range(txn, index, len);
        }))
    }

    /// Run a local mutation and encode everything it added relative to the
    /// state before it.
    fn local_change(&mut self, edit: impl FnOnce(&mut TransactionMut)) -> Option<Vec<u8>> {
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            edit(&mut txn);
        }
        let update = self.doc.transact().encode_state_as_update_v1(&before);
        if is_empty_update(&update) {
            None
        } else {
            Some(update)
        }
    }

    /// Merge a remote (or cached) update.
    pub fn merge(&mut self, update: &[u8]) -> Result<(), SyncError> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| SyncError::InvalidPayload(format!("undecodable update: {e}")))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| SyncError::InvalidPayload(format!("update rejected: {e}")))?;
        Ok(())
    }

    /// Current text content.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        txn.get_text(CONTENT)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Length of the text in characters.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        txn.get_text(CONTENT).map_or(0, |text| text.len(&txn))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoded state vector, for equality checks and diff requests.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Inserted and deleted content as of now. Equal snapshots mean equal
    /// replicas, which state vectors alone miss for deletions.
    pub fn snapshot(&self) -> Snapshot {
        self.doc.transact().snapshot()
    }

    /// Full state as a single update (cache snapshots, full replay).
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything this replica has that a peer at `state_vector` lacks.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, SyncError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| SyncError::InvalidPayload(format!("undecodable state vector: {e}")))?;
        Ok(self.doc.transact().encode_state_as_update_v1(&remote))
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Three replicas editing concurrently; returns every delta produced.
    fn concurrent_deltas() -> Vec<Vec<u8>> {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let mut c = Replica::new();

        let mut deltas = Vec::new();
        deltas.push(a.push("Hello").unwrap().unwrap());
        // b and c saw "Hello" before editing.
        b.merge(&deltas[0]).unwrap();
        c.merge(&deltas[0]).unwrap();
        deltas.push(a.push(", world").unwrap().unwrap());
        deltas.push(b.insert(0, ">> ").unwrap().unwrap());
        deltas.push(c.remove(1, 3).unwrap().unwrap());
        deltas.push(c.push("!").unwrap().unwrap());
        deltas
    }

    fn decoded_sv(replica: &Replica) -> StateVector {
        StateVector::decode_v1(&replica.state_vector()).unwrap()
    }

    fn apply_all(order: &[usize], deltas: &[Vec<u8>]) -> Replica {
        let mut replica = Replica::new();
        for &i in order {
            replica.merge(&deltas[i]).unwrap();
        }
        replica
    }

    #[test]
    fn test_local_edit_produces_delta() {
        let mut replica = Replica::new();
        let delta = replica.insert(0, "abc").unwrap().unwrap();
        assert!(!is_empty_update(&delta));
        assert_eq!(replica.text(), "abc");
        assert_eq!(replica.len(), 3);
    }

    #[test]
    fn test_noop_edits_produce_nothing() {
        let mut replica = Replica::new();
        assert!(replica.insert(0, "").unwrap().is_none());
        replica.push("abc").unwrap();
        assert!(replica.remove(1, 0).unwrap().is_none());
    }

    #[test]
    fn test_out_of_range_edits_rejected() {
        let mut replica = Replica::new();
        replica.push("abc").unwrap();
        assert!(matches!(replica.insert(4, "x"), Err(SyncError::InvalidPayload(_))));
        assert!(matches!(replica.remove(2, 2), Err(SyncError::InvalidPayload(_))));
        assert!(matches!(replica.remove(u32::MAX, 2), Err(SyncError::InvalidPayload(_))));
        assert_eq!(replica.text(), "abc");
    }

    #[test]
    fn test_delta_is_incremental() {
        let mut source = Replica::new();
        let first = source.push("Hello").unwrap().unwrap();
        let second = source.push(" there").unwrap().unwrap();

        let mut sink = Replica::new();
        sink.merge(&first).unwrap();
        assert_eq!(sink.text(), "Hello");
        sink.merge(&second).unwrap();
        assert_eq!(sink.text(), "Hello there");
    }

    #[test]
    fn test_convergence_any_order_with_duplicates() {
        let deltas = concurrent_deltas();
        let reference = apply_all(&[0, 1, 2, 3, 4], &deltas);

        for order in [
            vec![4, 3, 2, 1, 0],
            vec![2, 0, 4, 1, 3],
            vec![0, 0, 1, 2, 2, 3, 4, 4],
            vec![3, 1, 4, 0, 2, 3, 1, 0],
        ] {
            let replica = apply_all(&order, &deltas);
            assert_eq!(replica.text(), reference.text(), "order {order:?}");
            assert_eq!(decoded_sv(&replica), decoded_sv(&reference), "order {order:?}");
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let deltas = concurrent_deltas();
        let mut replica = apply_all(&[0, 1, 2, 3, 4], &deltas);
        let before = replica.text();
        for delta in &deltas {
            replica.merge(delta).unwrap();
        }
        assert_eq!(replica.text(), before);
    }

    #[test]
    fn test_full_replay_reconstructs_producer() {
        let mut producer = Replica::new();
        let mut log = Vec::new();
        for chunk in ["one ", "two ", "three"] {
            log.push(producer.push(chunk).unwrap().unwrap());
        }
        log.push(producer.remove(0, 4).unwrap().unwrap());

        let mut replay = Replica::new();
        for delta in &log {
            replay.merge(delta).unwrap();
        }
        assert_eq!(replay.text(), producer.text());
        assert_eq!(decoded_sv(&replay), decoded_sv(&producer));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut replica = Replica::new();
        replica.push("cached text").unwrap();
        let restored = Replica::from_snapshot(&replica.encode_state()).unwrap();
        assert_eq!(restored.text(), "cached text");
    }

    #[test]
    fn test_diff_since_brings_peer_up_to_date() {
        let mut ahead = Replica::new();
        let mut behind = Replica::new();
        let first = ahead.push("shared").unwrap().unwrap();
        behind.merge(&first).unwrap();
        ahead.push(" + more").unwrap();

        let diff = ahead.diff_since(&behind.state_vector()).unwrap();
        behind.merge(&diff).unwrap();
        assert_eq!(behind.text(), "shared + more");
    }

    #[test]
    fn test_snapshot_sees_deletions() {
        let mut a = Replica::new();
        let update = a.push("abc").unwrap().unwrap();
        let mut b = Replica::from_snapshot(&update).unwrap();
        assert!(a.snapshot() == b.snapshot());

        a.remove(0, 1).unwrap();
        assert_eq!(a.state_vector(), b.state_vector());
        assert!(a.snapshot() != b.snapshot());

        let diff = a.diff_since(&b.state_vector()).unwrap();
        b.merge(&diff).unwrap();
        assert_eq!(b.text(), "bc");
        assert!(a.snapshot() == b.snapshot());
    }

    #[test]
    fn test_garbage_update_rejected() {
        let mut replica = Replica::new();
        assert!(replica.merge(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
        assert!(replica.text().is_empty());
    }

    #[test]
    fn test_empty_update_detection() {
        assert!(is_empty_update(&[]));
        assert!(is_empty_update(&[0, 0]));
        assert!(is_empty_update(&Replica::new().encode_state()));

        let mut replica = Replica::new();
        replica.push("x").unwrap();
        assert!(!is_empty_update(&replica.encode_state()));
    }
}
