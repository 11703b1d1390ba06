//! In-memory storage backend.
//!
//! One [`MemoryStore`] implements every storage interface over a single
//! lock, so a batch publish (raw records, normalized records and the
//! checkpoint) is observed by readers all at once. Published records live in
//! `BTreeMap`s ordered by `(chain_id, block_number, identity)` so range scans
//! come back in block order; staged records sit in per-batch maps until
//! finalize or discard.

use super::{
    BatchHeader, BatchId, BatchJournal, BatchPublisher, BatchState, CasOutcome, CheckpointStore,
    JournalEntry, NormalizedStore, PutOutcome, RawStore, Stored, cas_apply,
    normalized_put_outcome, raw_put_outcome,
};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use strata_core::{
    BlockRange, ChainId, Checkpoint, DecodeStatus, IdentityKey, NormalizedRecord, RawRecord,
    SourceKey,
};

type RawSlot = (ChainId, u64, IdentityKey);
type NormalizedSlot = (ChainId, u64, IdentityKey, u32);

#[derive(Default)]
struct RawInner {
    visible: BTreeMap<RawSlot, Stored<RawRecord>>,
    blocks: HashMap<IdentityKey, u64>,
    staged: HashMap<BatchId, BTreeMap<IdentityKey, RawRecord>>,
}

impl RawInner {
    fn slot(&self, key: &IdentityKey) -> Option<RawSlot> {
        self.blocks.get(key).map(|block| (key.chain_id, *block, *key))
    }

    fn put(&mut self, batch: BatchId, record: &RawRecord) -> Result<PutOutcome> {
        let key = record.identity_key();

        if let Some(staged) = self.staged.get(&batch).and_then(|b| b.get(&key)) {
            let pending = Stored {
                record: staged.clone(),
                retracted: false,
            };
            return raw_put_outcome(Some(&pending), record);
        }

        let existing = self.slot(&key).and_then(|slot| self.visible.get(&slot));
        let outcome = raw_put_outcome(existing, record)?;
        if outcome != PutOutcome::Duplicate {
            self.staged
                .entry(batch)
                .or_default()
                .insert(key, record.clone());
        }
        Ok(outcome)
    }

    fn finalize(&mut self, batch: BatchId) -> usize {
        let Some(staged) = self.staged.remove(&batch) else {
            return 0;
        };
        let count = staged.len();
        for (key, record) in staged {
            self.blocks.insert(key, record.block_number);
            self.visible.insert(
                (key.chain_id, record.block_number, key),
                Stored {
                    record,
                    retracted: false,
                },
            );
        }
        count
    }
}

#[derive(Default)]
struct NormalizedInner {
    visible: BTreeMap<NormalizedSlot, Stored<NormalizedRecord>>,
    blocks: HashMap<IdentityKey, u64>,
    staged: HashMap<BatchId, BTreeMap<(IdentityKey, u32), NormalizedRecord>>,
}

impl NormalizedInner {
    fn finalize(&mut self, batch: BatchId) -> usize {
        let Some(staged) = self.staged.remove(&batch) else {
            return 0;
        };
        let count = staged.len();
        for ((key, ordinal), record) in staged {
            self.blocks.insert(key, record.block_number);
            self.visible.insert(
                (key.chain_id, record.block_number, key, ordinal),
                Stored {
                    record,
                    retracted: false,
                },
            );
        }
        count
    }
}

#[derive(Default)]
struct JournalInner {
    next_id: BatchId,
    entries: BTreeMap<BatchId, JournalEntry>,
}

#[derive(Default)]
struct MemoryState {
    raw: RawInner,
    normalized: NormalizedInner,
    checkpoints: HashMap<SourceKey, Checkpoint>,
    journal: JournalInner,
}

/// In-memory implementation of all storage interfaces.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl RawStore for MemoryStore {
    fn put(&self, batch: BatchId, record: &RawRecord) -> Result<PutOutcome> {
        self.state.write().raw.put(batch, record)
    }

    fn finalize(&self, batch: BatchId) -> Result<usize> {
        Ok(self.state.write().raw.finalize(batch))
    }

    fn discard(&self, batch: BatchId) -> Result<usize> {
        Ok(self
            .state
            .write()
            .raw
            .staged
            .remove(&batch)
            .map_or(0, |b| b.len()))
    }

    fn mark_retracted(&self, key: &IdentityKey) -> Result<bool> {
        let mut state = self.state.write();
        let raw = &mut state.raw;
        let Some(slot) = raw.slot(key) else {
            return Ok(false);
        };
        match raw.visible.get_mut(&slot) {
            Some(stored) if !stored.retracted => {
                stored.retracted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get(&self, key: &IdentityKey) -> Result<Option<Stored<RawRecord>>> {
        let state = self.state.read();
        Ok(state
            .raw
            .slot(key)
            .and_then(|slot| state.raw.visible.get(&slot))
            .cloned())
    }

    fn scan(&self, chain_id: ChainId, range: BlockRange) -> Result<Vec<Stored<RawRecord>>> {
        let state = self.state.read();
        Ok(state
            .raw
            .visible
            .range(slot_bounds(chain_id, range))
            .map(|(_, stored)| stored.clone())
            .collect())
    }
}

fn slot_bounds(
    chain_id: ChainId,
    range: BlockRange,
) -> std::ops::RangeInclusive<(ChainId, u64, IdentityKey)> {
    let low = IdentityKey {
        chain_id: ChainId::MIN,
        block_hash: strata_core::BlockHash::ZERO,
        sequence_index: 0,
    };
    let high = IdentityKey {
        chain_id: ChainId::MAX,
        block_hash: strata_core::BlockHash([0xff; 32]),
        sequence_index: u64::MAX,
    };
    (chain_id, range.start, low)..=(chain_id, range.end, high)
}

impl NormalizedStore for MemoryStore {
    fn put(&self, batch: BatchId, record: &NormalizedRecord) -> Result<PutOutcome> {
        let mut state = self.state.write();
        let normalized = &mut state.normalized;
        let slot = (
            record.key.chain_id,
            record.block_number,
            record.key,
            record.ordinal,
        );
        let outcome = normalized_put_outcome(normalized.visible.get(&slot), record);
        if outcome != PutOutcome::Duplicate {
            normalized
                .staged
                .entry(batch)
                .or_default()
                .insert((record.key, record.ordinal), record.clone());
        }
        Ok(outcome)
    }

    fn finalize(&self, batch: BatchId) -> Result<usize> {
        Ok(self.state.write().normalized.finalize(batch))
    }

    fn discard(&self, batch: BatchId) -> Result<usize> {
        Ok(self
            .state
            .write()
            .normalized
            .staged
            .remove(&batch)
            .map_or(0, |b| b.len()))
    }

    fn mark_retracted(&self, key: &IdentityKey) -> Result<usize> {
        let mut state = self.state.write();
        let normalized = &mut state.normalized;
        let Some(block) = normalized.blocks.get(key).copied() else {
            return Ok(0);
        };
        let mut changed = 0;
        for (_, stored) in normalized
            .visible
            .range_mut((key.chain_id, block, *key, 0)..=(key.chain_id, block, *key, u32::MAX))
        {
            if !stored.retracted {
                stored.retracted = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn get(&self, key: &IdentityKey) -> Result<Vec<Stored<NormalizedRecord>>> {
        let state = self.state.read();
        let Some(block) = state.normalized.blocks.get(key).copied() else {
            return Ok(Vec::new());
        };
        Ok(state
            .normalized
            .visible
            .range((key.chain_id, block, *key, 0)..=(key.chain_id, block, *key, u32::MAX))
            .map(|(_, stored)| stored.clone())
            .collect())
    }

    fn query(
        &self,
        chain_id: ChainId,
        range: BlockRange,
        status: Option<DecodeStatus>,
    ) -> Result<Vec<NormalizedRecord>> {
        let state = self.state.read();
        let bounds = slot_bounds(chain_id, range);
        let (low, high) = (*bounds.start(), *bounds.end());
        Ok(state
            .normalized
            .visible
            .range((low.0, low.1, low.2, 0)..=(high.0, high.1, high.2, u32::MAX))
            .map(|(_, stored)| stored)
            .filter(|stored| !stored.retracted)
            .filter(|stored| status.is_none_or(|s| stored.record.decode_status == s))
            .map(|stored| stored.record.clone())
            .collect())
    }
}

impl CheckpointStore for MemoryStore {
    fn get(&self, key: &SourceKey) -> Result<Option<Checkpoint>> {
        Ok(self.state.read().checkpoints.get(key).cloned())
    }

    fn compare_and_set(
        &self,
        key: &SourceKey,
        expected: Option<&Checkpoint>,
        new: Checkpoint,
    ) -> Result<CasOutcome> {
        let mut state = self.state.write();
        let outcome = cas_apply(state.checkpoints.get(key), expected, new);
        if let CasOutcome::Applied(stored) = &outcome {
            state.checkpoints.insert(key.clone(), stored.clone());
        }
        Ok(outcome)
    }

    fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut all: Vec<_> = self.state.read().checkpoints.values().cloned().collect();
        all.sort_by_key(|cp| cp.key());
        Ok(all)
    }
}

impl BatchPublisher for MemoryStore {
    fn publish(
        &self,
        batch: BatchId,
        source: &SourceKey,
        expected: Option<&Checkpoint>,
        next: Checkpoint,
    ) -> Result<CasOutcome> {
        let mut state = self.state.write();
        let outcome = cas_apply(state.checkpoints.get(source), expected, next);
        if let CasOutcome::Applied(stored) = &outcome {
            state.raw.finalize(batch);
            state.normalized.finalize(batch);
            state.checkpoints.insert(source.clone(), stored.clone());
        }
        Ok(outcome)
    }
}

impl BatchJournal for MemoryStore {
    fn next_batch_id(&self) -> Result<BatchId> {
        let mut state = self.state.write();
        state.journal.next_id += 1;
        Ok(state.journal.next_id)
    }

    fn open(&self, header: &BatchHeader) -> Result<()> {
        let mut state = self.state.write();
        if state.journal.entries.contains_key(&header.id) {
            return Err(Error::Batch(format!("batch {} already open", header.id)));
        }
        state.journal.entries.insert(
            header.id,
            JournalEntry {
                header: header.clone(),
                state: BatchState::Pending,
            },
        );
        Ok(())
    }

    fn finalize(&self, id: BatchId) -> Result<()> {
        match self.state.write().journal.entries.get_mut(&id) {
            Some(entry) => {
                entry.state = BatchState::Finalized;
                Ok(())
            }
            None => Err(Error::Batch(format!("batch {} not in journal", id))),
        }
    }

    fn close(&self, id: BatchId) -> Result<()> {
        self.state.write().journal.entries.remove(&id);
        Ok(())
    }

    fn entries(&self, source: &SourceKey) -> Result<Vec<JournalEntry>> {
        Ok(self
            .state
            .read()
            .journal
            .entries
            .values()
            .filter(|e| e.header.source == *source)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BatchKind;
    use chrono::Utc;
    use strata_core::{BlockHash, BlockPointer};

    fn raw(block: u64, seq: u64, payload: &[u8]) -> RawRecord {
        RawRecord {
            source_id: "test".into(),
            chain_id: 1,
            block_number: block,
            block_hash: BlockHash::from_low_u64(block),
            parent_hash: None,
            sequence_index: seq,
            payload: payload.to_vec(),
            ingested_at: Utc::now(),
        }
    }

    fn head(cp: &Checkpoint, block: u64) -> Checkpoint {
        let mut next = cp.clone();
        next.head = Some(BlockPointer::new(block, BlockHash::from_low_u64(block)));
        next
    }

    #[test]
    fn test_raw_staged_records_are_invisible_until_finalize() {
        let store = MemoryStore::default();
        let record = raw(100, 0, b"a");

        assert_eq!(RawStore::put(&store, 1, &record).unwrap(), PutOutcome::Inserted);
        assert!(RawStore::get(&store, &record.identity_key()).unwrap().is_none());
        assert!(store.scan(1, BlockRange::single(100)).unwrap().is_empty());

        assert_eq!(RawStore::finalize(&store, 1).unwrap(), 1);
        let stored = RawStore::get(&store, &record.identity_key()).unwrap().unwrap();
        assert!(!stored.retracted);
        assert_eq!(stored.record, record);
    }

    #[test]
    fn test_raw_discard_drops_batch() {
        let store = MemoryStore::default();
        RawStore::put(&store, 7, &raw(100, 0, b"a")).unwrap();
        RawStore::put(&store, 7, &raw(101, 0, b"b")).unwrap();
        assert_eq!(RawStore::discard(&store, 7).unwrap(), 2);
        assert_eq!(RawStore::finalize(&store, 7).unwrap(), 0);
        assert!(store.scan(1, BlockRange::new(0, 1000).unwrap()).unwrap().is_empty());
    }

    #[test]
    fn test_raw_duplicate_and_integrity_fault() {
        let store = MemoryStore::default();
        RawStore::put(&store, 1, &raw(100, 0, b"a")).unwrap();
        RawStore::finalize(&store, 1).unwrap();

        assert_eq!(
            RawStore::put(&store, 2, &raw(100, 0, b"a")).unwrap(),
            PutOutcome::Duplicate
        );
        let err = RawStore::put(&store, 2, &raw(100, 0, b"different")).unwrap_err();
        assert!(matches!(err, Error::IntegrityFault { .. }));

        // collision inside a single batch is caught too
        RawStore::put(&store, 3, &raw(200, 0, b"x")).unwrap();
        assert!(RawStore::put(&store, 3, &raw(200, 0, b"y")).is_err());
    }

    #[test]
    fn test_raw_retract_and_revive() {
        let store = MemoryStore::default();
        let record = raw(100, 0, b"a");
        let key = record.identity_key();
        RawStore::put(&store, 1, &record).unwrap();
        RawStore::finalize(&store, 1).unwrap();

        assert!(RawStore::mark_retracted(&store, &key).unwrap());
        assert!(!RawStore::mark_retracted(&store, &key).unwrap());
        assert!(RawStore::get(&store, &key).unwrap().unwrap().retracted);

        assert_eq!(RawStore::put(&store, 2, &record).unwrap(), PutOutcome::Inserted);
        RawStore::finalize(&store, 2).unwrap();
        assert!(!RawStore::get(&store, &key).unwrap().unwrap().retracted);
    }

    #[test]
    fn test_raw_scan_is_block_ordered_and_bounded() {
        let store = MemoryStore::default();
        for block in [103, 100, 102, 101] {
            RawStore::put(&store, 1, &raw(block, 0, b"p")).unwrap();
        }
        RawStore::finalize(&store, 1).unwrap();

        let blocks: Vec<u64> = store
            .scan(1, BlockRange::new(101, 102).unwrap())
            .unwrap()
            .iter()
            .map(|s| s.record.block_number)
            .collect();
        assert_eq!(blocks, vec![101, 102]);
        assert!(store.scan(2, BlockRange::from(0)).unwrap().is_empty());
    }

    #[test]
    fn test_normalized_upsert_and_cascade() {
        let store = MemoryStore::default();
        let key = raw(100, 0, b"a").identity_key();
        let mut first = NormalizedRecord::quarantined(key, 0, 100, b"a".to_vec(), "no schema");
        let second = NormalizedRecord::quarantined(key, 1, 100, b"a".to_vec(), "no schema");

        assert_eq!(
            NormalizedStore::put(&store, 1, &first).unwrap(),
            PutOutcome::Inserted
        );
        NormalizedStore::put(&store, 1, &second).unwrap();
        NormalizedStore::finalize(&store, 1).unwrap();
        assert_eq!(
            NormalizedStore::put(&store, 2, &first).unwrap(),
            PutOutcome::Duplicate
        );

        first.decode_status = DecodeStatus::Ok;
        first.quarantine_reason = None;
        assert_eq!(
            NormalizedStore::put(&store, 2, &first).unwrap(),
            PutOutcome::Replaced
        );
        NormalizedStore::finalize(&store, 2).unwrap();

        let range = BlockRange::single(100);
        assert_eq!(store.query(1, range, Some(DecodeStatus::Ok)).unwrap().len(), 1);
        assert_eq!(
            store.query(1, range, Some(DecodeStatus::Quarantined)).unwrap().len(),
            1
        );

        assert_eq!(NormalizedStore::mark_retracted(&store, &key).unwrap(), 2);
        assert!(store.query(1, range, None).unwrap().is_empty());
        assert!(
            NormalizedStore::get(&store, &key)
                .unwrap()
                .iter()
                .all(|s| s.retracted)
        );
    }

    #[test]
    fn test_checkpoint_compare_and_set() {
        let store = MemoryStore::default();
        let key = SourceKey::new("ws", 1);
        let cp = head(&Checkpoint::empty(&key), 10);

        let applied = match store.compare_and_set(&key, None, cp.clone()).unwrap() {
            CasOutcome::Applied(cp) => cp,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(applied.version, 1);

        // stale expectation loses
        let outcome = store.compare_and_set(&key, None, cp.clone()).unwrap();
        assert_eq!(outcome, CasOutcome::Conflict(Some(applied.clone())));

        let outcome = store.compare_and_set(&key, Some(&applied), cp).unwrap();
        assert!(matches!(outcome, CasOutcome::Applied(ref c) if c.version == 2));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_publish_lands_records_and_checkpoint_together() {
        let store = MemoryStore::default();
        let key = SourceKey::new("ws", 1);
        let record = raw(100, 0, b"a");
        let normalized =
            NormalizedRecord::quarantined(record.identity_key(), 0, 100, b"a".to_vec(), "x");
        RawStore::put(&store, 4, &record).unwrap();
        NormalizedStore::put(&store, 4, &normalized).unwrap();

        let outcome = store
            .publish(4, &key, None, head(&Checkpoint::empty(&key), 100))
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Applied(ref c) if c.version == 1));
        assert!(RawStore::get(&store, &record.identity_key()).unwrap().is_some());
        assert_eq!(store.query(1, BlockRange::single(100), None).unwrap().len(), 1);
        assert_eq!(
            CheckpointStore::get(&store, &key).unwrap().unwrap().block_number(),
            Some(100)
        );
        // nothing left staged
        assert_eq!(RawStore::discard(&store, 4).unwrap(), 0);
    }

    #[test]
    fn test_publish_conflict_publishes_nothing() {
        let store = MemoryStore::default();
        let key = SourceKey::new("ws", 1);
        let current = match store
            .compare_and_set(&key, None, head(&Checkpoint::empty(&key), 99))
            .unwrap()
        {
            CasOutcome::Applied(cp) => cp,
            other => panic!("unexpected {:?}", other),
        };
        let record = raw(100, 0, b"a");
        RawStore::put(&store, 4, &record).unwrap();
        NormalizedStore::put(
            &store,
            4,
            &NormalizedRecord::quarantined(record.identity_key(), 0, 100, b"a".to_vec(), "x"),
        )
        .unwrap();

        // stale expectation: no checkpoint
        let outcome = store.publish(4, &key, None, head(&current, 100)).unwrap();
        assert_eq!(outcome, CasOutcome::Conflict(Some(current.clone())));
        assert!(RawStore::get(&store, &record.identity_key()).unwrap().is_none());
        assert!(store.query(1, BlockRange::single(100), None).unwrap().is_empty());
        assert_eq!(CheckpointStore::get(&store, &key).unwrap(), Some(current.clone()));

        // the staged batch is still there for the retry
        let outcome = store
            .publish(4, &key, Some(&current), head(&current, 100))
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Applied(_)));
        assert!(RawStore::get(&store, &record.identity_key()).unwrap().is_some());
    }

    #[test]
    fn test_journal_lifecycle() {
        let journal = MemoryStore::default();
        let source = SourceKey::new("ws", 1);
        let id = journal.next_batch_id().unwrap();
        assert_ne!(id, journal.next_batch_id().unwrap());

        let header = BatchHeader {
            id,
            source: source.clone(),
            kind: BatchKind::Ingest,
            range: Some(BlockRange::new(1, 2).unwrap()),
            replay_from: Some(1),
            previous: None,
            target: None,
            raw_count: 2,
            normalized_count: 0,
            opened_at: Utc::now(),
        };
        journal.open(&header).unwrap();
        assert!(journal.open(&header).is_err());
        assert_eq!(journal.entries(&source).unwrap()[0].state, BatchState::Pending);

        BatchJournal::finalize(&journal, id).unwrap();
        assert_eq!(
            journal.entries(&source).unwrap()[0].state,
            BatchState::Finalized
        );
        journal.close(id).unwrap();
        assert!(journal.entries(&source).unwrap().is_empty());
        assert!(BatchJournal::finalize(&journal, id).is_err());
    }
}
