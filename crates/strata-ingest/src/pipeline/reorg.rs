//! Reorg reconciliation.
//!
//! [`ReorgReconciler`] is a two-state machine per source. A [`ReorgEvent`]
//! moves it from `stable` to `reconciling`; while it holds the source's
//! reconciliation lock it retracts the superseded records, cascades the
//! retraction to the normalized tier, and rewinds the tracker, checkpoint and
//! deduplicator to the block before the event. It returns to `stable` once
//! the checkpoint has been re-committed up to the height the old chain had
//! reached.

use super::commit::CommitPipeline;
use super::dedupe::Deduplicator;
use super::sequence::SequenceTracker;
use crate::Result;
use crate::store::Storage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use strata_core::{
    BlockPointer, BlockRange, Checkpoint, RawRecord, ReorgEvent, SourceKey,
    metrics as core_metrics,
};
use tracing::{info, warn};

/// Exclusive per-source lock held by reconciliation and by every commit.
pub type SourceLock = Arc<Mutex<()>>;

/// Registry of per-source reconciliation locks, shared across workers.
#[derive(Clone, Default)]
pub struct ReconciliationLocks {
    locks: Arc<Mutex<HashMap<SourceKey, SourceLock>>>,
}

impl ReconciliationLocks {
    pub fn lock_for(&self, source: &SourceKey) -> SourceLock {
        self.locks.lock().entry(source.clone()).or_default().clone()
    }
}

/// Reconciler state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileState {
    Stable,
    Reconciling {
        event: ReorgEvent,
        /// Height the checkpoint must reach again before returning to stable.
        restore_to: u64,
    },
}

impl ReconcileState {
    pub fn is_stable(&self) -> bool {
        matches!(self, ReconcileState::Stable)
    }
}

/// What one reconciliation did, and what must be ingested again.
#[derive(Debug)]
pub struct Reconciliation {
    pub event: ReorgEvent,
    pub retracted_raw: usize,
    pub retracted_normalized: usize,
    /// Uncommitted records dropped from the open batch.
    pub discarded_pending: usize,
    /// Range to request again from the source.
    pub replay: BlockRange,
    /// Records the tracker was buffering; observe them again.
    pub requeue: Vec<RawRecord>,
    pub checkpoint: Checkpoint,
}

/// Per-source reorg state machine.
pub struct ReorgReconciler {
    source: SourceKey,
    label: String,
    storage: Storage,
    state: ReconcileState,
    reorgs: u64,
}

impl ReorgReconciler {
    pub fn new(source: SourceKey, storage: Storage) -> Self {
        Self {
            label: source.to_string(),
            source,
            storage,
            state: ReconcileState::Stable,
            reorgs: 0,
        }
    }

    pub fn state(&self) -> &ReconcileState {
        &self.state
    }

    /// Reorgs handled since start.
    pub fn reorgs(&self) -> u64 {
        self.reorgs
    }

    /// Reconcile `event` against committed and in-progress state.
    ///
    /// Holds the source's reconciliation lock for the whole operation, so no
    /// batch for this source commits until the rewind is durable.
    pub fn begin(
        &mut self,
        event: ReorgEvent,
        tracker: &mut SequenceTracker,
        dedupe: &mut Deduplicator,
        commit: &mut CommitPipeline,
    ) -> Result<Reconciliation> {
        let lock = commit.lock();
        let _guard = lock.lock();

        let n = event.block_number;
        let chain_id = self.source.chain_id;
        warn!(
            "{}: reorg at block {} ({} -> {})",
            self.label, n, event.old_hash, event.new_hash
        );

        // the old chain reached at least this far
        let old_height = [
            Some(n),
            tracker.tip().map(|t| t.number),
            commit.checkpoint().and_then(|c| c.block_number()),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(n);
        let restore_to = match &self.state {
            ReconcileState::Reconciling { restore_to, .. } => old_height.max(*restore_to),
            ReconcileState::Stable => old_height,
        };

        let discarded_pending = commit.discard_from(n);

        let mut retracted_raw = 0;
        let mut retracted_normalized = 0;
        for stored in self.storage.raw.scan(chain_id, BlockRange::from(n))? {
            if stored.retracted {
                continue;
            }
            let record = &stored.record;
            let superseded =
                record.block_number > n || record.block_hash == event.old_hash;
            if !superseded {
                continue;
            }
            let key = record.identity_key();
            if self.storage.raw.mark_retracted(&key)? {
                retracted_raw += 1;
            }
            retracted_normalized += self.storage.normalized.mark_retracted(&key)?;
        }

        let rewind_to = event.rewind_to();
        tracker.reinstate(BlockPointer::new(n, event.new_hash));
        let requeue = tracker.rewind(rewind_to);
        let head = match tracker.tip() {
            Some(tip) => Some(tip),
            None => rewind_to.and_then(|to| self.live_pointer_at(to)),
        };
        if head.is_none() && rewind_to.is_some() {
            warn!(
                "{}: no canonical hash known below block {}, checkpoint cleared",
                self.label, n
            );
        }
        let checkpoint = commit.rewind_checkpoint(head)?;
        let forgotten = dedupe.forget_from(chain_id, n);

        self.state = ReconcileState::Reconciling {
            event: event.clone(),
            restore_to,
        };
        self.reorgs += 1;

        core_metrics::increment_for("reorg_events_total", &self.label, 1);
        core_metrics::increment("reorg_records_retracted_total", retracted_raw as u64);
        core_metrics::set_gauge_for("reorg_reconciling", &self.label, 1.0);
        if let Some(block) = checkpoint.block_number() {
            core_metrics::set_gauge_for("checkpoint_block", &self.label, block as f64);
        }

        info!(
            "{}: retracted {} raw / {} normalized records, dropped {} pending, forgot {} keys; rewound to {:?}, replaying {}..={}",
            self.label,
            retracted_raw,
            retracted_normalized,
            discarded_pending,
            forgotten,
            rewind_to,
            n,
            restore_to
        );

        Ok(Reconciliation {
            event,
            retracted_raw,
            retracted_normalized,
            discarded_pending,
            replay: BlockRange::new(n, restore_to)?,
            requeue,
            checkpoint,
        })
    }

    /// Observe a committed checkpoint. Returns true when this commit ended
    /// reconciliation.
    pub fn on_commit(&mut self, checkpoint: &Checkpoint) -> bool {
        let ReconcileState::Reconciling { event, restore_to } = &self.state else {
            return false;
        };
        let Some(head) = checkpoint.block_number() else {
            return false;
        };
        if head < *restore_to || !checkpoint.in_flight.is_empty() {
            return false;
        }
        info!(
            "{}: reorg at block {} reconciled, checkpoint back at {}",
            self.label, event.block_number, head
        );
        self.state = ReconcileState::Stable;
        core_metrics::set_gauge_for("reorg_reconciling", &self.label, 0.0);
        true
    }

    /// Hash of a live raw record at `block`, if any.
    fn live_pointer_at(&self, block: u64) -> Option<BlockPointer> {
        let records = self
            .storage
            .raw
            .scan(self.source.chain_id, BlockRange::single(block))
            .ok()?;
        records
            .iter()
            .find(|s| !s.retracted)
            .map(|s| s.record.pointer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::commit::CommitConfig;
    use crate::pipeline::dedupe::{DedupeConfig, Verdict};
    use crate::pipeline::sequence::{Admission, TrackerConfig};
    use chrono::Utc;
    use std::time::Instant;
    use strata_core::{BlockHash, DecodeStatus, HEADER_SEQUENCE, NormalizedRecord};

    fn hash(n: u64) -> BlockHash {
        BlockHash::from_low_u64(n)
    }

    fn fork(n: u64) -> BlockHash {
        BlockHash::from_low_u64(1000 + n)
    }

    fn record(n: u64, h: BlockHash, parent: BlockHash, seq: u64) -> RawRecord {
        RawRecord {
            source_id: "ws".into(),
            chain_id: 1,
            block_number: n,
            block_hash: h,
            parent_hash: Some(parent),
            sequence_index: seq,
            payload: format!("{}:{}", h, seq).into_bytes(),
            ingested_at: Utc::now(),
        }
    }

    struct Harness {
        storage: Storage,
        tracker: SequenceTracker,
        dedupe: Deduplicator,
        commit: CommitPipeline,
        reconciler: ReorgReconciler,
    }

    impl Harness {
        fn new() -> Self {
            let storage = Storage::in_memory();
            let source = SourceKey::new("ws", 1);
            let locks = ReconciliationLocks::default();
            Self {
                tracker: SequenceTracker::new(source.clone(), TrackerConfig::default()),
                dedupe: Deduplicator::new(DedupeConfig::default()),
                commit: CommitPipeline::new(
                    source.clone(),
                    storage.clone(),
                    CommitConfig::default(),
                    locks.lock_for(&source),
                )
                .unwrap(),
                reconciler: ReorgReconciler::new(source, storage.clone()),
                storage,
            }
        }

        fn ingest(&mut self, r: RawRecord) -> Option<ReorgEvent> {
            let now = Instant::now();
            match self.tracker.observe(r, now) {
                Admission::Accepted { record, drained } => {
                    assert!(drained.is_empty());
                    if self.dedupe.check_and_mark(&record, now) == Verdict::New {
                        let key = record.identity_key();
                        let normalized = if record.is_header() {
                            Vec::new()
                        } else {
                            vec![NormalizedRecord::quarantined(
                                key,
                                0,
                                record.block_number,
                                record.payload.clone(),
                                "no schema",
                            )]
                        };
                        self.commit.push(record, normalized, now);
                    }
                    None
                }
                Admission::Reorg { event, .. } => Some(event),
                other => panic!("unexpected {:?}", other),
            }
        }

        fn block(&mut self, n: u64, h: BlockHash, parent: BlockHash) -> Option<ReorgEvent> {
            if let Some(event) = self.ingest(record(n, h, parent, 0)) {
                return Some(event);
            }
            self.ingest(record(n, h, parent, HEADER_SEQUENCE))
        }

        fn flush(&mut self) -> Checkpoint {
            self.commit.flush().unwrap().unwrap().checkpoint
        }

        fn reconcile(&mut self, event: ReorgEvent) -> Reconciliation {
            self.reconciler
                .begin(event, &mut self.tracker, &mut self.dedupe, &mut self.commit)
                .unwrap()
        }
    }

    #[test]
    fn test_reorg_retracts_and_rewinds() {
        let mut h = Harness::new();
        h.block(100, hash(100), hash(99));
        for n in 101..=103 {
            h.block(n, hash(n), hash(n - 1));
        }
        assert_eq!(h.flush().block_number(), Some(103));

        let event = h
            .block(101, fork(101), hash(100))
            .expect("conflicting hash at 101");
        assert_eq!(event.old_hash, hash(101));

        let result = h.reconcile(event);
        assert_eq!(result.retracted_raw, 6);
        assert_eq!(result.retracted_normalized, 3);
        assert_eq!(result.replay, BlockRange::new(101, 103).unwrap());
        assert_eq!(
            result.checkpoint.head,
            Some(BlockPointer::new(100, hash(100)))
        );
        assert!(!h.reconciler.state().is_stable());

        let live = h.storage.raw.scan(1, BlockRange::new(101, 103).unwrap()).unwrap();
        assert!(live.iter().all(|s| s.retracted));
        assert!(
            h.storage
                .normalized
                .query(1, BlockRange::new(101, 103).unwrap(), None)
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            h.storage
                .normalized
                .query(1, BlockRange::single(100), Some(DecodeStatus::Quarantined))
                .unwrap()
                .len(),
            1
        );

        // re-ingest the new fork
        h.block(101, fork(101), hash(100));
        h.block(102, fork(102), fork(101));
        let cp = h.flush();
        assert_eq!(cp.block_number(), Some(102));
        assert!(!h.reconciler.on_commit(&cp));

        h.block(103, fork(103), fork(102));
        let cp = h.flush();
        assert_eq!(cp.head, Some(BlockPointer::new(103, fork(103))));
        assert!(h.reconciler.on_commit(&cp));
        assert!(h.reconciler.state().is_stable());
    }

    #[test]
    fn test_reorg_drops_uncommitted_records() {
        let mut h = Harness::new();
        h.block(100, hash(100), hash(99));
        h.flush();
        h.block(101, hash(101), hash(100));
        h.block(102, hash(102), hash(101));

        let event = h.block(101, fork(101), hash(100)).unwrap();
        let result = h.reconcile(event);
        assert_eq!(result.discarded_pending, 4);
        assert_eq!(result.retracted_raw, 0);
        assert_eq!(result.replay, BlockRange::new(101, 102).unwrap());
        assert_eq!(h.commit.pending(), 0);
    }

    #[test]
    fn test_nested_reorg_keeps_highest_restore_target() {
        let mut h = Harness::new();
        h.block(100, hash(100), hash(99));
        for n in 101..=105 {
            h.block(n, hash(n), hash(n - 1));
        }
        h.flush();

        let event = h.block(103, fork(103), hash(102)).unwrap();
        h.reconcile(event);
        h.block(103, fork(103), hash(102));
        h.flush();

        // a deeper reorg arrives before the first one settled
        let event = h.block(102, BlockHash::from_low_u64(2102), hash(101)).unwrap();
        let result = h.reconcile(event);
        assert_eq!(result.replay, BlockRange::new(102, 105).unwrap());
        match h.reconciler.state() {
            ReconcileState::Reconciling { restore_to, event } => {
                assert_eq!(*restore_to, 105);
                assert_eq!(event.block_number, 102);
            }
            ReconcileState::Stable => panic!("expected reconciling"),
        }
        assert_eq!(h.reconciler.reorgs(), 2);
    }

    #[test]
    fn test_rewind_is_not_blocked_by_checkpoint_monotonicity() {
        let mut h = Harness::new();
        h.block(100, hash(100), hash(99));
        h.block(101, hash(101), hash(100));
        h.flush();

        let event = h.block(101, fork(101), hash(100)).unwrap();
        let result = h.reconcile(event);
        let stored = h.storage.checkpoints.get(&SourceKey::new("ws", 1)).unwrap().unwrap();
        assert_eq!(stored, result.checkpoint);
        assert_eq!(stored.block_number(), Some(100));
    }

    #[test]
    fn test_locks_are_shared_per_source() {
        let locks = ReconciliationLocks::default();
        let a = locks.lock_for(&SourceKey::new("ws", 1));
        let b = locks.lock_for(&SourceKey::new("ws", 1));
        let c = locks.lock_for(&SourceKey::new("ws", 2));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let _held = a.lock();
        assert!(b.try_lock().is_none());
        assert!(c.try_lock().is_some());
    }
}
