//! Exactly-once commit of accepted records.
//!
//! The [`CommitPipeline`] buffers accepted raw records with their decoded
//! normalized records and writes them as one batch, bounded by count or age,
//! whichever comes first. A batch moves through the write-ahead protocol:
//!
//! 1. `journal.open` records the header with a pending marker
//! 2. the checkpoint gains the batch range in `in_flight`
//! 3. raw and normalized records are staged (invisible to readers)
//! 4. `journal.finalize` flips the marker; this is the commit point
//! 5. one publish step makes the staged records visible and advances the
//!    checkpoint to the batch target, dropping the range
//! 6. `journal.close` removes the entry
//!
//! Readers never see a batch's records without its checkpoint, or the
//! reverse: a checkpoint conflict at step 5 leaves everything staged.
//!
//! A crash before step 4 leaves a pending entry: [`CommitPipeline::recover`]
//! discards it and reports the block to replay from. A crash after step 4
//! leaves a finalized entry, which recovery rolls forward. Replaying a batch
//! that already landed stages nothing, because the raw store reports every
//! record as a duplicate.

use super::reorg::SourceLock;
use crate::store::{BatchHeader, BatchId, BatchKind, BatchState, CasOutcome, PutOutcome, Storage};
use crate::{Error, Result};
use chrono::Utc;
use std::time::{Duration, Instant};
use strata_core::{
    BlockPointer, BlockRange, Checkpoint, NormalizedRecord, RawRecord, SourceKey,
    metrics as core_metrics,
};
use tracing::{debug, error, info, warn};

/// Commit tuning.
#[derive(Debug, Clone)]
pub struct CommitConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Compare-and-set attempts before a checkpoint conflict is fatal.
    pub cas_retry_budget: u32,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            batch_timeout: Duration::from_millis(2000),
            cas_retry_budget: 5,
        }
    }
}

/// A raw record waiting to be committed with what it decoded to.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub raw: RawRecord,
    pub normalized: Vec<NormalizedRecord>,
}

/// What one flush wrote.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub id: BatchId,
    pub range: BlockRange,
    pub raw_inserted: usize,
    pub raw_duplicates: usize,
    pub normalized_written: usize,
    pub checkpoint: Checkpoint,
}

/// What [`CommitPipeline::recover`] found in the journal.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub rolled_forward: usize,
    pub discarded: usize,
    /// Lowest block a discarded batch covered; ingestion must restart here.
    pub replay_from: Option<u64>,
}

/// Counters kept across flushes.
#[derive(Debug, Clone, Default)]
pub struct CommitStats {
    pub batches: u64,
    pub raw_inserted: u64,
    pub raw_duplicates: u64,
    pub normalized_written: u64,
    pub checkpoint_conflicts: u64,
}

/// Single-writer batch committer for one source.
pub struct CommitPipeline {
    source: SourceKey,
    label: String,
    storage: Storage,
    config: CommitConfig,
    lock: SourceLock,
    buffer: Vec<PendingRecord>,
    opened_at: Option<Instant>,
    checkpoint: Option<Checkpoint>,
    stats: CommitStats,
}

impl CommitPipeline {
    /// Create a pipeline and load the current checkpoint.
    pub fn new(
        source: SourceKey,
        storage: Storage,
        config: CommitConfig,
        lock: SourceLock,
    ) -> Result<Self> {
        let checkpoint = storage.checkpoints.get(&source)?;
        Ok(Self {
            label: source.to_string(),
            source,
            storage,
            config,
            lock,
            buffer: Vec::new(),
            opened_at: None,
            checkpoint,
            stats: CommitStats::default(),
        })
    }

    pub fn source(&self) -> &SourceKey {
        &self.source
    }

    /// Cached copy of the last checkpoint this pipeline read or wrote.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    pub fn stats(&self) -> &CommitStats {
        &self.stats
    }

    /// The reconciliation lock every flush takes.
    pub fn lock(&self) -> SourceLock {
        self.lock.clone()
    }

    /// Records waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Queue a record and its decoded output.
    pub fn push(&mut self, raw: RawRecord, normalized: Vec<NormalizedRecord>, now: Instant) {
        self.opened_at.get_or_insert(now);
        self.buffer.push(PendingRecord { raw, normalized });
    }

    /// Whether the open batch hit its size or age bound.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        self.buffer.len() >= self.config.batch_size
            || self
                .opened_at
                .is_some_and(|t| now.duration_since(t) >= self.config.batch_timeout)
    }

    /// Drop buffered records at or above `block_number`. Returns the count.
    pub fn discard_from(&mut self, block_number: u64) -> usize {
        let before = self.buffer.len();
        self.buffer.retain(|p| p.raw.block_number < block_number);
        if self.buffer.is_empty() {
            self.opened_at = None;
        }
        before - self.buffer.len()
    }

    /// Write the open batch. Returns `None` when nothing was buffered.
    ///
    /// Blocks while the source's reconciliation lock is held elsewhere. An
    /// integrity fault leaves the batch pending in the journal (held for the
    /// operator) and is returned as an error.
    pub fn flush(&mut self) -> Result<Option<BatchSummary>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let lock = self.lock.clone();
        let _guard = lock.lock();

        let records = std::mem::take(&mut self.buffer);
        self.opened_at = None;
        let started = Instant::now();

        let range = batch_range(&records)?;
        let target = batch_target(&records);
        let normalized_count = records.iter().map(|p| p.normalized.len()).sum();

        // refresh the cached copy; other writers may have moved it
        self.checkpoint = self.storage.checkpoints.get(&self.source)?;

        let id = self.storage.journal.next_batch_id()?;
        let header = BatchHeader {
            id,
            source: self.source.clone(),
            kind: BatchKind::Ingest,
            range: Some(range),
            replay_from: Some(range.start),
            previous: self.checkpoint.clone(),
            target,
            raw_count: records.len(),
            normalized_count,
            opened_at: Utc::now(),
        };
        self.storage.journal.open(&header)?;
        self.update_checkpoint(|cp| cp.with_in_flight(range))?;

        let mut raw_inserted = 0;
        let mut raw_duplicates = 0;
        let mut normalized_written = 0;
        for pending in &records {
            match self.storage.raw.put(id, &pending.raw) {
                Ok(PutOutcome::Duplicate) => {
                    raw_duplicates += 1;
                    continue;
                }
                Ok(_) => raw_inserted += 1,
                Err(e) => {
                    error!(
                        "{}: batch {} held pending after write failure: {}",
                        self.label, id, e
                    );
                    return Err(e);
                }
            }
            for normalized in &pending.normalized {
                if self.storage.normalized.put(id, normalized)? != PutOutcome::Duplicate {
                    normalized_written += 1;
                }
            }
        }

        self.storage.journal.finalize(id)?;
        let checkpoint = self.publish(id, |cp| {
            cp.advanced(furthest(cp.head, target), Some(range))
        })?;
        self.storage.journal.close(id)?;

        self.stats.batches += 1;
        self.stats.raw_inserted += raw_inserted as u64;
        self.stats.raw_duplicates += raw_duplicates as u64;
        self.stats.normalized_written += normalized_written as u64;

        core_metrics::increment("commit_batches_total", 1);
        core_metrics::increment("commit_records_raw_total", raw_inserted as u64);
        core_metrics::increment("commit_records_normalized_total", normalized_written as u64);
        metrics::histogram!("commit_batch_duration_seconds").record(started.elapsed().as_secs_f64());
        if let Some(block) = checkpoint.block_number() {
            core_metrics::set_gauge_for("checkpoint_block", &self.label, block as f64);
        }

        debug!(
            "{}: batch {} committed {} ({} raw, {} duplicate, {} normalized)",
            self.label, id, range, raw_inserted, raw_duplicates, normalized_written
        );

        Ok(Some(BatchSummary {
            id,
            range,
            raw_inserted,
            raw_duplicates,
            normalized_written,
            checkpoint,
        }))
    }

    /// Move the checkpoint back to `head` and drop in-flight ranges above it.
    ///
    /// The caller must hold this source's reconciliation lock.
    pub fn rewind_checkpoint(&mut self, head: Option<BlockPointer>) -> Result<Checkpoint> {
        let floor = head.map_or(0, |h| h.number + 1);
        self.update_checkpoint(|cp| {
            let mut next = cp.advanced(head, None);
            next.in_flight.retain(|r| r.end < floor);
            next
        })
    }

    /// Normalized-only batch, used when quarantined records are re-decoded.
    /// Leaves the checkpoint alone. Records whose raw record is no longer
    /// live are skipped.
    pub fn commit_normalized(&mut self, records: &[NormalizedRecord]) -> Result<usize> {
        let lock = self.lock.clone();
        let _guard = lock.lock();

        let mut live = Vec::with_capacity(records.len());
        for record in records {
            if self
                .storage
                .raw
                .get(&record.key)?
                .is_some_and(|stored| !stored.retracted)
            {
                live.push(record);
            }
        }
        if live.is_empty() {
            return Ok(0);
        }
        let records = live;

        let id = self.storage.journal.next_batch_id()?;
        let range = records
            .iter()
            .map(|r| BlockRange::single(r.block_number))
            .reduce(|a, b| a.union(&b));
        let header = BatchHeader {
            id,
            source: self.source.clone(),
            kind: BatchKind::Reprocess,
            range,
            replay_from: None,
            previous: None,
            target: None,
            raw_count: 0,
            normalized_count: records.len(),
            opened_at: Utc::now(),
        };
        self.storage.journal.open(&header)?;

        let mut written = 0;
        for record in records {
            if self.storage.normalized.put(id, record)? != PutOutcome::Duplicate {
                written += 1;
            }
        }

        self.storage.journal.finalize(id)?;
        self.storage.normalized.finalize(id)?;
        self.storage.journal.close(id)?;
        Ok(written)
    }

    /// Resolve journal entries left behind by a previous run.
    pub fn recover(&mut self) -> Result<RecoveryReport> {
        let lock = self.lock.clone();
        let _guard = lock.lock();
        let mut report = RecoveryReport::default();

        for entry in self.storage.journal.entries(&self.source)? {
            let header = entry.header;
            match entry.state {
                BatchState::Pending => {
                    let raw = self.storage.raw.discard(header.id)?;
                    let normalized = self.storage.normalized.discard(header.id)?;
                    if let Some(range) = header.range
                        && header.kind == BatchKind::Ingest
                    {
                        self.update_checkpoint(|cp| cp.advanced(cp.head, Some(range)))?;
                    }
                    if let Some(from) = header.replay_from {
                        report.replay_from =
                            Some(report.replay_from.map_or(from, |r: u64| r.min(from)));
                    }
                    warn!(
                        "{}: discarded pending batch {} ({} raw, {} normalized staged)",
                        self.label, header.id, raw, normalized
                    );
                    report.discarded += 1;
                    metrics::counter!("commit_batches_recovered_total", "action" => "discarded")
                        .increment(1);
                }
                BatchState::Finalized => {
                    if header.kind == BatchKind::Ingest {
                        let target = header.target;
                        let range = header.range;
                        self.publish(header.id, |cp| {
                            cp.advanced(furthest(cp.head, target), range)
                        })?;
                    } else {
                        self.storage.normalized.finalize(header.id)?;
                    }
                    info!("{}: rolled forward finalized batch {}", self.label, header.id);
                    report.rolled_forward += 1;
                    metrics::counter!("commit_batches_recovered_total", "action" => "rolled_forward")
                        .increment(1);
                }
            }
            self.storage.journal.close(header.id)?;
        }

        self.checkpoint = self.storage.checkpoints.get(&self.source)?;
        Ok(report)
    }

    /// Apply `f` to the current checkpoint with compare-and-set, re-reading
    /// and retrying on conflict up to the retry budget.
    fn update_checkpoint<F>(&mut self, f: F) -> Result<Checkpoint>
    where
        F: Fn(&Checkpoint) -> Checkpoint,
    {
        self.write_checkpoint(None, f)
    }

    /// Publish batch `id` together with the checkpoint produced by `f`.
    fn publish<F>(&mut self, id: BatchId, f: F) -> Result<Checkpoint>
    where
        F: Fn(&Checkpoint) -> Checkpoint,
    {
        self.write_checkpoint(Some(id), f)
    }

    fn write_checkpoint<F>(&mut self, batch: Option<BatchId>, f: F) -> Result<Checkpoint>
    where
        F: Fn(&Checkpoint) -> Checkpoint,
    {
        let mut expected = self.checkpoint.clone();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let base = expected
                .clone()
                .unwrap_or_else(|| Checkpoint::empty(&self.source));
            let next = f(&base);
            let outcome = match batch {
                Some(id) => {
                    self.storage
                        .publisher
                        .publish(id, &self.source, expected.as_ref(), next)?
                }
                None => {
                    self.storage
                        .checkpoints
                        .compare_and_set(&self.source, expected.as_ref(), next)?
                }
            };
            match outcome {
                CasOutcome::Applied(stored) => {
                    self.checkpoint = Some(stored.clone());
                    return Ok(stored);
                }
                CasOutcome::Conflict(current) => {
                    self.stats.checkpoint_conflicts += 1;
                    core_metrics::increment("commit_checkpoint_conflicts_total", 1);
                    if attempts >= self.config.cas_retry_budget {
                        return Err(Error::CheckpointConflict {
                            key: self.label.clone(),
                            attempts,
                        });
                    }
                    warn!(
                        "{}: checkpoint changed underneath us (attempt {}), retrying",
                        self.label, attempts
                    );
                    expected = current;
                }
            }
        }
    }
}

fn batch_range(records: &[PendingRecord]) -> Result<BlockRange> {
    let start = records.iter().map(|p| p.raw.block_number).min().unwrap_or(0);
    let end = records.iter().map(|p| p.raw.block_number).max().unwrap_or(0);
    Ok(BlockRange::new(start, end)?)
}

/// Highest block in the batch; among records of that block, the last one.
fn batch_target(records: &[PendingRecord]) -> Option<BlockPointer> {
    records
        .iter()
        .map(|p| p.raw.pointer())
        .fold(None, |best: Option<BlockPointer>, p| match best {
            Some(b) if b.number > p.number => Some(b),
            _ => Some(p),
        })
}

/// The higher of two heads; the current one wins ties so a commit never
/// moves the checkpoint sideways.
fn furthest(current: Option<BlockPointer>, target: Option<BlockPointer>) -> Option<BlockPointer> {
    match (current, target) {
        (Some(c), Some(t)) if t.number > c.number => Some(t),
        (Some(c), _) => Some(c),
        (None, t) => t,
    }
}
