//! Per-source position tracking, gap buffering, and reorg detection.
//!
//! The tracker holds the last accepted `(block_number, block_hash)` for one
//! `(source_id, chain_id)` and the canonical hashes of the most recent
//! `confirmation_depth` blocks. Every record is classified against them:
//!
//! | record block `n` vs tip `t`       | outcome                                  |
//! |-----------------------------------|------------------------------------------|
//! | `n == t + 1`, parent matches       | accept, advance, drain buffered `t + 2`  |
//! | `n == t + 1`, parent differs       | reorg at `t`                             |
//! | `n <= t`, hash known and equal     | accept (deduplicator drops repeats)      |
//! | `n <= t`, hash known and different | reorg at `n`                             |
//! | `n <= t`, unknown or orphaned hash | stale, dropped                           |
//! | `n > t + 1`                        | buffer; backfill on overflow or timeout  |
//!
//! The tracker never mutates itself on a reorg; the reconciler decides and
//! calls [`SequenceTracker::rewind`]. Hashes dropped by a rewind stay
//! orphaned until a later reorg names one of them as canonical again
//! ([`SequenceTracker::reinstate`]), which clears it and its orphaned
//! ancestors.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use strata_core::{BlockHash, BlockPointer, BlockRange, RawRecord, ReorgEvent, SourceKey};
use tracing::{debug, warn};

/// Tracker tuning.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Recent blocks whose hashes are remembered for reorg detection.
    pub confirmation_depth: u64,
    /// Maximum records buffered ahead of the tip.
    pub max_buffered: usize,
    /// How long a gap may persist before a backfill is requested.
    pub gap_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            confirmation_depth: 64,
            max_buffered: 10_000,
            gap_timeout: Duration::from_secs(10),
        }
    }
}

/// How a record was classified.
#[derive(Debug)]
pub enum Admission {
    /// Forward `record` downstream. `drained` records were waiting on it and
    /// must be observed next, in order.
    Accepted {
        record: RawRecord,
        drained: Vec<RawRecord>,
    },
    /// Held ahead of the tip. Carries a backfill request when the buffer
    /// overflowed.
    Buffered { backfill: Option<BlockRange> },
    /// The record contradicts the tracked chain. Observe `record` again after
    /// reconciliation.
    Reorg { event: ReorgEvent, record: RawRecord },
    /// Too old to verify, or from an orphaned fork.
    Stale(RawRecord),
}

/// Tracks one source's position on one chain.
pub struct SequenceTracker {
    source: SourceKey,
    config: TrackerConfig,
    tip: Option<BlockPointer>,
    /// First block expected while there is no tip.
    floor: Option<u64>,
    history: BTreeMap<u64, BlockHash>,
    /// Parent of every block accepted within the window, by `(number, hash)`.
    parents: HashMap<(u64, BlockHash), BlockHash>,
    orphaned: HashSet<(u64, BlockHash)>,
    buffer: BTreeMap<u64, Vec<RawRecord>>,
    buffered: usize,
    gap_since: Option<Instant>,
}

impl SequenceTracker {
    pub fn new(source: SourceKey, config: TrackerConfig) -> Self {
        Self {
            source,
            config,
            tip: None,
            floor: None,
            history: BTreeMap::new(),
            parents: HashMap::new(),
            orphaned: HashSet::new(),
            buffer: BTreeMap::new(),
            buffered: 0,
            gap_since: None,
        }
    }

    /// Start from a committed position with known recent canonical blocks
    /// (`history` in any order; only the last `confirmation_depth` are kept).
    pub fn resume(&mut self, head: BlockPointer, history: impl IntoIterator<Item = BlockPointer>) {
        self.history.clear();
        for pointer in history {
            if pointer.number <= head.number {
                self.history.insert(pointer.number, pointer.hash);
            }
        }
        self.history.insert(head.number, head.hash);
        self.tip = Some(head);
        self.floor = None;
        self.prune_history();
    }

    /// Without a tip, accept nothing below `block`.
    pub fn start_at(&mut self, block: u64) {
        if self.tip.is_none() {
            self.floor = Some(block);
        }
    }

    pub fn tip(&self) -> Option<BlockPointer> {
        self.tip
    }

    /// Canonical hash remembered at `block`.
    pub fn canonical_hash(&self, block: u64) -> Option<BlockHash> {
        self.history.get(&block).copied()
    }

    /// Records waiting ahead of the tip.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Classify one record.
    pub fn observe(&mut self, record: RawRecord, now: Instant) -> Admission {
        let n = record.block_number;

        if self.orphaned.contains(&(n, record.block_hash)) {
            return Admission::Stale(record);
        }

        let Some(tip) = self.tip else {
            return match self.floor {
                Some(floor) if n < floor => Admission::Stale(record),
                Some(floor) if n > floor => self.buffer_record(record, now),
                _ => self.accept(record),
            };
        };

        if n == tip.number + 1 {
            if let Some(parent) = record.parent_hash
                && parent != tip.hash
            {
                return Admission::Reorg {
                    event: self.reorg_event(tip.number, tip.hash, parent),
                    record,
                };
            }
            return self.accept(record);
        }

        if n <= tip.number {
            return match self.history.get(&n).copied() {
                Some(hash) if hash == record.block_hash => self.check_parent_of_known(record),
                Some(old) => Admission::Reorg {
                    event: self.reorg_event(n, old, record.block_hash),
                    record,
                },
                None => {
                    debug!(
                        "{}: block {} is below the tracked window (tip {})",
                        self.source, n, tip.number
                    );
                    Admission::Stale(record)
                }
            };
        }

        self.buffer_record(record, now)
    }

    /// A known block may still reveal that its parent was replaced.
    fn check_parent_of_known(&mut self, record: RawRecord) -> Admission {
        let n = record.block_number;
        if let Some(parent) = record.parent_hash
            && let Some(expected) = n.checked_sub(1).and_then(|p| self.history.get(&p))
            && *expected != parent
        {
            let old = *expected;
            return Admission::Reorg {
                event: self.reorg_event(n - 1, old, parent),
                record,
            };
        }
        Admission::Accepted {
            record,
            drained: Vec::new(),
        }
    }

    fn accept(&mut self, record: RawRecord) -> Admission {
        let pointer = record.pointer();
        self.tip = Some(pointer);
        self.floor = None;
        self.history.insert(pointer.number, pointer.hash);
        if let Some(parent) = record.parent_hash {
            self.parents.insert((pointer.number, pointer.hash), parent);
        }
        self.prune_history();

        let drained = self.buffer.remove(&(pointer.number + 1)).unwrap_or_default();
        self.buffered -= drained.len();
        if self.buffer.is_empty() {
            self.gap_since = None;
        }

        Admission::Accepted { record, drained }
    }

    fn buffer_record(&mut self, record: RawRecord, now: Instant) -> Admission {
        let n = record.block_number;
        self.buffer.entry(n).or_default().push(record);
        self.buffered += 1;
        self.gap_since.get_or_insert(now);
        metrics::counter!("sequence_gaps_total").increment(1);

        if self.buffered <= self.config.max_buffered {
            return Admission::Buffered { backfill: None };
        }

        // Overflow: ask for everything up to the highest buffered block and
        // let the backfill redeliver what we drop here.
        let start = self.next_expected();
        let end = self.buffer.keys().next_back().copied().unwrap_or(n);
        warn!(
            "{}: gap buffer overflow ({} records), backfilling {}..={}",
            self.source, self.buffered, start, end
        );
        self.buffer.clear();
        self.buffered = 0;
        self.gap_since = None;
        Admission::Buffered {
            backfill: BlockRange::new(start, end).ok(),
        }
    }

    fn next_expected(&self) -> u64 {
        match (self.tip, self.floor) {
            (Some(tip), _) => tip.number + 1,
            (None, Some(floor)) => floor,
            (None, None) => self.buffer.keys().next().copied().unwrap_or(0),
        }
    }

    /// Missing range between the tip and the first buffered block.
    pub fn gap(&self) -> Option<BlockRange> {
        let first_buffered = *self.buffer.keys().next()?;
        let start = self.next_expected();
        if first_buffered <= start {
            return None;
        }
        BlockRange::new(start, first_buffered - 1).ok()
    }

    /// Missing range to backfill if the current gap outlived the timeout.
    pub fn poll_gap(&mut self, now: Instant) -> Option<BlockRange> {
        let since = self.gap_since?;
        if now.duration_since(since) < self.config.gap_timeout {
            return None;
        }
        let range = self.gap()?;
        // restart the clock so the request repeats only once per timeout
        self.gap_since = Some(now);
        Some(range)
    }

    /// Rewind to `to` (the last block still canonical), forgetting every
    /// hash above it. Returns buffered records for re-observation, minus any
    /// from the orphaned fork.
    pub fn rewind(&mut self, to: Option<u64>) -> Vec<RawRecord> {
        let dropped = match to {
            Some(to) => self.history.split_off(&(to + 1)),
            None => std::mem::take(&mut self.history),
        };
        for (number, hash) in dropped {
            self.orphaned.insert((number, hash));
        }

        self.tip = to.and_then(|n| self.history.get(&n).map(|h| BlockPointer::new(n, *h)));
        self.floor = match self.tip {
            Some(_) => None,
            None => Some(to.map_or(0, |n| n + 1)),
        };

        let buffered = std::mem::take(&mut self.buffer);
        self.buffered = 0;
        self.gap_since = None;
        buffered
            .into_values()
            .flatten()
            .filter(|r| !self.orphaned.contains(&(r.block_number, r.block_hash)))
            .collect()
    }

    /// Clear `pointer` from the orphaned set, walking down through the
    /// orphaned blocks it descends from. Called when a reorg names `pointer`
    /// as the new canonical block, so a chain that flips back to an earlier
    /// fork is ingested again instead of dropped as stale.
    pub fn reinstate(&mut self, pointer: BlockPointer) {
        let mut cursor = Some(pointer);
        while let Some(p) = cursor {
            if !self.orphaned.remove(&(p.number, p.hash)) {
                break;
            }
            debug!("{}: block {} ({}) is canonical again", self.source, p.number, p.hash);
            cursor = match (self.parents.get(&(p.number, p.hash)), p.number.checked_sub(1)) {
                (Some(parent), Some(number)) => Some(BlockPointer::new(number, *parent)),
                _ => None,
            };
        }
    }

    fn reorg_event(&self, block_number: u64, old_hash: BlockHash, new_hash: BlockHash) -> ReorgEvent {
        ReorgEvent {
            source_id: self.source.source_id.clone(),
            chain_id: self.source.chain_id,
            block_number,
            old_hash,
            new_hash,
            detected_at: Utc::now(),
        }
    }

    fn prune_history(&mut self) {
        let Some(tip) = self.tip else { return };
        let horizon = tip.number.saturating_sub(self.config.confirmation_depth);
        if horizon == 0 {
            return;
        }
        self.history = self.history.split_off(&horizon);
        self.parents.retain(|(n, _), _| *n >= horizon);
        self.orphaned.retain(|(n, _)| *n >= horizon);
    }
}
