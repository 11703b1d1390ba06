//! Per-source ingestion worker.
//!
//! One [`Worker`] runs per `(source_id, chain_id)`. It is split in two tasks
//! joined by a bounded queue:
//!
//! - **ingress** pulls records from the source with a deadline, tears the
//!   stream down on timeout or transient failure, and reconnects at the last
//!   committed checkpoint with exponential backoff. It also serves backfill
//!   requests from the processing side.
//! - **processing** drives a [`Processor`]: sequence tracking,
//!   deduplication, decoding, batching and reorg reconciliation.
//!
//! A full queue blocks ingress; an empty queue parks processing.
//!
//! # Shutdown
//!
//! When the cancellation token fires, ingress stops, records already queued
//! are processed, and the open batch is flushed before the worker returns.

use crate::pipeline::{
    Admission, BatchSummary, CommitConfig, CommitPipeline, DedupeConfig, Decoder, Deduplicator,
    ReconcileState, ReorgReconciler, SequenceTracker, SourceLock, TrackerConfig, Verdict,
};
use crate::source::{Backoff, RecordStream, Source};
use crate::store::Storage;
use crate::{Config, Error, Result};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use strata_core::{
    BlockHash, BlockPointer, BlockRange, Checkpoint, RawRecord, SourceKey,
    metrics as core_metrics,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempts per backfill range before it is given up.
const MAX_BACKFILL_ATTEMPTS: u32 = 3;

/// Runtime settings shared by every worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub tracker: TrackerConfig,
    pub dedupe: DedupeConfig,
    pub commit: CommitConfig,
    /// Deadline for the next record before the source is torn down.
    pub source_timeout: Duration,
    pub queue_capacity: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            dedupe: DedupeConfig::default(),
            commit: CommitConfig::default(),
            source_timeout: Duration::from_secs(30),
            queue_capacity: 4096,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tracker: config.tracker_config(),
            dedupe: config.dedupe_config(),
            commit: config.commit_config(),
            source_timeout: Duration::from_millis(config.tuning.source_timeout_ms),
            queue_capacity: config.tuning.queue_capacity,
            backoff_initial: Duration::from_millis(config.tuning.backoff_initial_ms),
            backoff_max: Duration::from_millis(config.tuning.backoff_max_ms),
        }
    }
}

/// Counters kept by a [`Processor`].
#[derive(Debug, Clone, Default)]
pub struct ProcessorStats {
    pub received: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub decoded_ok: u64,
    pub quarantined: u64,
    pub backfills_requested: u64,
}

/// The synchronous half of a worker: everything between the source and the
/// stores for one source.
pub struct Processor {
    source: SourceKey,
    label: String,
    tracker: SequenceTracker,
    dedupe: Deduplicator,
    decoder: Decoder,
    commit: CommitPipeline,
    reconciler: ReorgReconciler,
    resume_from: Option<u64>,
    stats: ProcessorStats,
}

impl Processor {
    /// Recover the journal, then position the tracker on the committed
    /// checkpoint (or at `start_block` when there is none).
    pub fn open(
        source: SourceKey,
        start_block: u64,
        storage: Storage,
        decoder: Decoder,
        config: &WorkerConfig,
        lock: SourceLock,
    ) -> Result<Self> {
        let label = source.to_string();
        let mut commit =
            CommitPipeline::new(source.clone(), storage.clone(), config.commit.clone(), lock)?;
        let recovery = commit.recover()?;
        if recovery.discarded + recovery.rolled_forward > 0 {
            info!(
                "{}: recovered journal ({} rolled forward, {} discarded)",
                label, recovery.rolled_forward, recovery.discarded
            );
        }

        let mut tracker = SequenceTracker::new(source.clone(), config.tracker.clone());
        let head = commit.checkpoint().and_then(|c| c.head);
        match head {
            Some(head) => {
                let history =
                    canonical_history(&storage, &source, head, config.tracker.confirmation_depth)?;
                tracker.resume(head, history);
            }
            None => tracker.start_at(start_block),
        }

        // the head block is delivered again so its parent linkage is checked
        let resume_from = match (head.map(|h| h.number), recovery.replay_from) {
            (Some(h), Some(r)) => Some(h.min(r)),
            (h, r) => h.or(r),
        };
        info!("{}: resuming from {:?} (start block {})", label, resume_from, start_block);

        Ok(Self {
            reconciler: ReorgReconciler::new(source.clone(), storage),
            dedupe: Deduplicator::new(config.dedupe.clone()),
            source,
            label,
            tracker,
            decoder,
            commit,
            resume_from,
            stats: ProcessorStats::default(),
        })
    }

    pub fn source(&self) -> &SourceKey {
        &self.source
    }

    /// Block to subscribe from; `None` means the source's start block.
    pub fn resume_from(&self) -> Option<u64> {
        self.resume_from
    }

    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.commit.checkpoint().cloned()
    }

    pub fn reconcile_state(&self) -> &ReconcileState {
        self.reconciler.state()
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    /// Records decoded but not yet committed.
    pub fn pending(&self) -> usize {
        self.commit.pending()
    }

    /// The range still missing below buffered out-of-order records.
    pub fn gap(&self) -> Option<BlockRange> {
        self.tracker.gap()
    }

    /// Run one record through the pipeline. Returns ranges to backfill.
    pub fn handle(&mut self, record: RawRecord, now: Instant) -> Result<Vec<BlockRange>> {
        self.stats.received += 1;
        core_metrics::increment_for("ingest_records_total", &self.label, 1);

        let mut backfills = Vec::new();
        let mut queue = VecDeque::from([record]);
        while let Some(record) = queue.pop_front() {
            match self.tracker.observe(record, now) {
                Admission::Accepted { record, drained } => {
                    for waiting in drained.into_iter().rev() {
                        queue.push_front(waiting);
                    }
                    self.admit(record, now);
                }
                Admission::Buffered { backfill } => {
                    if let Some(range) = backfill {
                        self.request(range, &mut backfills);
                    }
                }
                Admission::Reorg { event, record } => {
                    let reconciliation = self.reconciler.begin(
                        event,
                        &mut self.tracker,
                        &mut self.dedupe,
                        &mut self.commit,
                    )?;
                    self.request(reconciliation.replay, &mut backfills);
                    queue.push_front(record);
                    queue.extend(reconciliation.requeue);
                }
                Admission::Stale(record) => {
                    self.stats.stale += 1;
                    core_metrics::increment("ingest_records_stale_total", 1);
                    debug!(
                        "{}: dropped stale record at block {}",
                        self.label, record.block_number
                    );
                }
            }
        }

        if let Some(range) = self.tracker.poll_gap(now) {
            self.request(range, &mut backfills);
        }
        if self.commit.is_due(now) {
            self.flush()?;
        }
        Ok(backfills)
    }

    /// Periodic work: gap timeouts and batch age.
    pub fn tick(&mut self, now: Instant) -> Result<Vec<BlockRange>> {
        let mut backfills = Vec::new();
        if let Some(range) = self.tracker.poll_gap(now) {
            self.request(range, &mut backfills);
        }
        if self.commit.is_due(now) {
            self.flush()?;
        }
        Ok(backfills)
    }

    /// Commit the open batch, if any.
    pub fn flush(&mut self) -> Result<Option<BatchSummary>> {
        let summary = self.commit.flush()?;
        if let Some(summary) = &summary {
            self.reconciler.on_commit(&summary.checkpoint);
        }
        Ok(summary)
    }

    fn admit(&mut self, record: RawRecord, now: Instant) {
        match self.dedupe.check_and_mark(&record, now) {
            Verdict::Duplicate => {
                self.stats.duplicates += 1;
                core_metrics::increment("ingest_records_duplicate_total", 1);
                return;
            }
            // a conflict goes on to the commit path, which holds the batch
            Verdict::New | Verdict::Conflict => {}
        }
        self.stats.accepted += 1;

        let normalized = self.decoder.decode(&record);
        let quarantined = normalized.iter().filter(|n| n.is_quarantined()).count() as u64;
        let ok = normalized.len() as u64 - quarantined;
        self.stats.decoded_ok += ok;
        self.stats.quarantined += quarantined;
        core_metrics::increment("decode_records_ok_total", ok);
        if quarantined > 0 {
            core_metrics::increment("decode_records_quarantined_total", quarantined);
            warn!(
                "{}: quarantined {} of {} records decoded from {}",
                self.label,
                quarantined,
                normalized.len(),
                record.identity_key()
            );
        }

        self.commit.push(record, normalized, now);
    }

    fn request(&mut self, range: BlockRange, out: &mut Vec<BlockRange>) {
        self.stats.backfills_requested += 1;
        core_metrics::increment("sequence_backfills_requested_total", 1);
        debug!("{}: requesting backfill {}", self.label, range);
        out.push(range);
    }

    /// How often the processing task should call [`Processor::tick`].
    fn tick_interval(config: &WorkerConfig) -> Duration {
        (config.commit.batch_timeout.min(config.tracker.gap_timeout) / 4)
            .max(Duration::from_millis(10))
    }
}

/// Canonical block hashes below `head` that were committed, newest first
/// up to `depth` blocks. Header records win over event records.
fn canonical_history(
    storage: &Storage,
    source: &SourceKey,
    head: BlockPointer,
    depth: u64,
) -> Result<Vec<BlockPointer>> {
    let start = head.number.saturating_sub(depth.saturating_sub(1));
    let range = BlockRange::new(start, head.number)?;
    let mut hashes: BTreeMap<u64, BlockHash> = BTreeMap::new();
    for stored in storage.raw.scan(source.chain_id, range)? {
        if stored.retracted {
            continue;
        }
        let record = &stored.record;
        if record.is_header() {
            hashes.insert(record.block_number, record.block_hash);
        } else {
            hashes.entry(record.block_number).or_insert(record.block_hash);
        }
    }
    Ok(hashes
        .into_iter()
        .map(|(number, hash)| BlockPointer::new(number, hash))
        .collect())
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Cancelled; queued records were drained and flushed.
    Stopped,
    /// A finite source was fully ingested.
    Completed,
    /// A fatal fault stopped the worker. Restart after remediation.
    Halted(String),
}

impl fmt::Display for WorkerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerOutcome::Stopped => f.write_str("stopped"),
            WorkerOutcome::Completed => f.write_str("completed"),
            WorkerOutcome::Halted(fault) => write!(f, "halted: {}", fault),
        }
    }
}

/// Final state of one worker.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub source: SourceKey,
    /// Last stable checkpoint.
    pub checkpoint: Option<Checkpoint>,
    pub outcome: WorkerOutcome,
}

impl WorkerReport {
    pub fn is_halted(&self) -> bool {
        matches!(self.outcome, WorkerOutcome::Halted(_))
    }
}

/// Messages from ingress to processing.
enum Ingress {
    Record(RawRecord),
    /// A backfill range was delivered (or given up).
    BackfillDone(BlockRange),
    /// The subscription ended on its own.
    End,
    /// The source failed in a way retrying will not fix.
    Failed(Error),
}

/// Ingestion worker for one source.
pub struct Worker {
    source: Source,
    storage: Storage,
    decoder: Decoder,
    config: WorkerConfig,
    lock: SourceLock,
}

impl Worker {
    pub fn new(
        source: Source,
        storage: Storage,
        decoder: Decoder,
        config: WorkerConfig,
        lock: SourceLock,
    ) -> Self {
        Self {
            source,
            storage,
            decoder,
            config,
            lock,
        }
    }

    pub fn key(&self) -> &SourceKey {
        self.source.key()
    }

    /// Run until the source completes, a fatal fault occurs, or `cancel`
    /// fires.
    pub async fn run(self, cancel: CancellationToken) -> WorkerReport {
        let key = self.source.key().clone();
        let label = key.to_string();

        let mut processor = match Processor::open(
            key.clone(),
            self.source.start_block(),
            self.storage.clone(),
            self.decoder.clone(),
            &self.config,
            self.lock.clone(),
        ) {
            Ok(p) => p,
            Err(e) => {
                let checkpoint = self.storage.checkpoints.get(&key).ok().flatten();
                return halted(key, checkpoint, e);
            }
        };

        info!("{}: starting {} worker", label, self.source.kind());

        let (tx, mut rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let ingress_cancel = cancel.child_token();
        let ingress = tokio::spawn(
            IngressTask {
                source: self.source.clone(),
                storage: self.storage.clone(),
                config: self.config.clone(),
                label: label.clone(),
            }
            .run(processor.resume_from(), tx, command_rx, ingress_cancel.clone()),
        );

        let result = process(&mut processor, &mut rx, &commands, &cancel, &self.config).await;

        ingress_cancel.cancel();
        drop(commands);

        let result = match result {
            Ok(WorkerOutcome::Stopped) => drain(&mut processor, &mut rx).await,
            other => other,
        };
        if let Err(e) = ingress.await {
            warn!("{}: ingress task ended abnormally: {}", label, e);
        }

        match result {
            Ok(outcome) => {
                let checkpoint = processor.checkpoint();
                info!(
                    "{}: worker {} at {:?} ({} records, {} duplicates, {} quarantined)",
                    label,
                    outcome,
                    checkpoint.as_ref().and_then(|c| c.block_number()),
                    processor.stats().received,
                    processor.stats().duplicates,
                    processor.stats().quarantined
                );
                WorkerReport {
                    source: key,
                    checkpoint,
                    outcome,
                }
            }
            Err(e) => halted(key, processor.checkpoint(), e),
        }
    }
}

fn halted(source: SourceKey, checkpoint: Option<Checkpoint>, fault: Error) -> WorkerReport {
    error!(
        "{}: worker halted at checkpoint {:?}: {}",
        source,
        checkpoint.as_ref().and_then(|c| c.head),
        fault
    );
    core_metrics::increment_for("worker_halted_total", &source.to_string(), 1);
    WorkerReport {
        source,
        checkpoint,
        outcome: WorkerOutcome::Halted(fault.to_string()),
    }
}

/// Processing loop. Returns `Stopped` on cancellation, `Completed` once a
/// finite source and its backfills are exhausted.
async fn process(
    processor: &mut Processor,
    rx: &mut mpsc::Receiver<Ingress>,
    commands: &mpsc::UnboundedSender<BlockRange>,
    cancel: &CancellationToken,
    config: &WorkerConfig,
) -> Result<WorkerOutcome> {
    let label = processor.source().to_string();
    let mut ticker = tokio::time::interval(Processor::tick_interval(config));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut ended = false;
    let mut outstanding = 0usize;
    let mut last_forced: Option<BlockRange> = None;

    loop {
        let backfills = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(WorkerOutcome::Stopped),
            message = rx.recv() => match message {
                Some(Ingress::Record(record)) => processor.handle(record, Instant::now())?,
                Some(Ingress::BackfillDone(range)) => {
                    debug!("{}: backfill {} delivered", label, range);
                    outstanding = outstanding.saturating_sub(1);
                    Vec::new()
                }
                Some(Ingress::End) => {
                    ended = true;
                    Vec::new()
                }
                Some(Ingress::Failed(e)) => return Err(e),
                None => return Err(Error::ChannelRecv),
            },
            _ = ticker.tick() => {
                core_metrics::set_gauge_for("ingest_queue_depth", &label, rx.len() as f64);
                processor.tick(Instant::now())?
            }
        };

        for range in backfills {
            if commands.send(range).is_ok() {
                outstanding += 1;
            }
        }

        if ended && outstanding == 0 {
            match processor.gap() {
                Some(range) if last_forced != Some(range) => {
                    last_forced = Some(range);
                    if commands.send(range).is_ok() {
                        outstanding += 1;
                    }
                }
                gap => {
                    if let Some(range) = gap {
                        warn!("{}: blocks {} were never delivered", label, range);
                    }
                    processor.flush()?;
                    if !processor.reconcile_state().is_stable() {
                        warn!("{}: source ended while still reconciling a reorg", label);
                    }
                    return Ok(WorkerOutcome::Completed);
                }
            }
        }
    }
}

/// Process whatever ingress queued before it stopped, then flush.
async fn drain(processor: &mut Processor, rx: &mut mpsc::Receiver<Ingress>) -> Result<WorkerOutcome> {
    let mut drained = 0usize;
    while let Some(message) = rx.recv().await {
        if let Ingress::Record(record) = message {
            processor.handle(record, Instant::now())?;
            drained += 1;
        }
    }
    let summary = processor.flush()?;
    info!(
        "{}: drained {} queued records, final batch {:?}",
        processor.source(),
        drained,
        summary.map(|s| s.range)
    );
    Ok(WorkerOutcome::Stopped)
}

struct Backfill {
    range: BlockRange,
    stream: RecordStream,
    attempts: u32,
}

/// Source side of a worker.
struct IngressTask {
    source: Source,
    storage: Storage,
    config: WorkerConfig,
    label: String,
}

impl IngressTask {
    async fn run(
        self,
        from: Option<u64>,
        tx: mpsc::Sender<Ingress>,
        mut commands: mpsc::UnboundedReceiver<BlockRange>,
        cancel: CancellationToken,
    ) {
        let deadline = self.config.source_timeout + self.source.poll_interval().unwrap_or_default();
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        let mut live = Some(self.source.subscribe(from));
        let mut queued: VecDeque<(BlockRange, u32)> = VecDeque::new();
        let mut current: Option<Backfill> = None;

        loop {
            if current.is_none()
                && let Some((range, attempts)) = queued.pop_front()
            {
                current = Some(Backfill {
                    range,
                    stream: self.source.backfill(range),
                    attempts,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                command = commands.recv() => match command {
                    Some(range) => queued.push_back((range, 0)),
                    None => return,
                },
                item = next_from(live.as_mut(), deadline), if live.is_some() => match item {
                    Some(Ok(record)) => {
                        backoff.reset();
                        if !forward(&tx, Ingress::Record(record), &cancel).await {
                            return;
                        }
                    }
                    Some(Err(e)) if e.is_transient() => {
                        live = None;
                        if matches!(e, Error::Timeout(_)) {
                            core_metrics::increment_for("source_timeouts_total", &self.label, 1);
                            warn!("{}: no record within {:?}, tearing down", self.label, deadline);
                        } else {
                            warn!("{}: source failed: {}", self.label, e);
                        }
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        let resume = self.resume_position(from);
                        core_metrics::increment_for("source_reconnects_total", &self.label, 1);
                        info!(
                            "{}: reconnecting from {:?} (attempt {})",
                            self.label,
                            resume,
                            backoff.attempts()
                        );
                        live = Some(self.source.subscribe(resume));
                    }
                    Some(Err(e)) => {
                        error!("{}: source failed permanently: {}", self.label, e);
                        let _ = forward(&tx, Ingress::Failed(e), &cancel).await;
                        return;
                    }
                    None => {
                        info!("{}: source stream complete", self.label);
                        live = None;
                        if !forward(&tx, Ingress::End, &cancel).await {
                            return;
                        }
                    }
                },
                item = next_from(current.as_mut().map(|b| &mut b.stream), deadline), if current.is_some() => {
                    match item {
                        Some(Ok(record)) => {
                            if !forward(&tx, Ingress::Record(record), &cancel).await {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            if let Some(failed) = current.take() {
                                let attempts = failed.attempts + 1;
                                if e.is_transient() && attempts < MAX_BACKFILL_ATTEMPTS {
                                    warn!(
                                        "{}: backfill {} failed (attempt {}): {}",
                                        self.label, failed.range, attempts, e
                                    );
                                    tokio::select! {
                                        _ = cancel.cancelled() => return,
                                        _ = tokio::time::sleep(self.config.backoff_initial * attempts) => {}
                                    }
                                    queued.push_front((failed.range, attempts));
                                } else {
                                    warn!(
                                        "{}: giving up on backfill {}: {}",
                                        self.label, failed.range, e
                                    );
                                    if !forward(&tx, Ingress::BackfillDone(failed.range), &cancel).await {
                                        return;
                                    }
                                }
                            }
                        }
                        None => {
                            if let Some(done) = current.take()
                                && !forward(&tx, Ingress::BackfillDone(done.range), &cancel).await
                            {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Last committed position, falling back to where this run started.
    fn resume_position(&self, initial: Option<u64>) -> Option<u64> {
        match self.storage.checkpoints.get(self.source.key()) {
            Ok(checkpoint) => checkpoint.and_then(|c| c.resume_from()).or(initial),
            Err(e) => {
                warn!("{}: could not read checkpoint: {}", self.label, e);
                initial
            }
        }
    }
}

async fn next_from(stream: Option<&mut RecordStream>, deadline: Duration) -> Option<Result<RawRecord>> {
    match stream {
        Some(stream) => stream.next_within(deadline).await,
        None => std::future::pending().await,
    }
}

/// Queue a message for processing. False once the worker is shutting down.
async fn forward(tx: &mpsc::Sender<Ingress>, message: Ingress, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(message) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ReconciliationLocks;
    use crate::schema::InMemorySchemaRegistry;
    use crate::source::{JsonlConfig, JsonlSource};
    use crate::store::RawStore;
    use chrono::Utc;
    use std::io::Write;
    use std::sync::Arc;
    use strata_core::HEADER_SEQUENCE;
    use tempfile::TempDir;

    fn hash(n: u64) -> BlockHash {
        BlockHash::from_low_u64(n)
    }

    fn record(n: u64, h: BlockHash, parent: BlockHash, seq: u64, payload: &[u8]) -> RawRecord {
        RawRecord {
            source_id: "replay".into(),
            chain_id: 1,
            block_number: n,
            block_hash: h,
            parent_hash: Some(parent),
            sequence_index: seq,
            payload: payload.to_vec(),
            ingested_at: Utc::now(),
        }
    }

    /// One event record and the header for block `n`.
    fn block(n: u64, h: BlockHash, parent: BlockHash) -> Vec<RawRecord> {
        vec![
            record(n, h, parent, 0, br#"{"logs":[]}"#),
            record(n, h, parent, HEADER_SEQUENCE, format!(r#"{{"number":{}}}"#, n).as_bytes()),
        ]
    }

    fn chain(blocks: std::ops::RangeInclusive<u64>) -> Vec<RawRecord> {
        blocks.flat_map(|n| block(n, hash(n), hash(n - 1))).collect()
    }

    fn decoder() -> Decoder {
        Decoder::new(Arc::new(InMemorySchemaRegistry::new()))
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            commit: CommitConfig {
                batch_size: 1000,
                batch_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            source_timeout: Duration::from_millis(500),
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn processor(storage: &Storage) -> Processor {
        let key = SourceKey::new("replay", 1);
        let lock = ReconciliationLocks::default().lock_for(&key);
        Processor::open(key, 100, storage.clone(), decoder(), &config(), lock).unwrap()
    }

    fn feed(p: &mut Processor, records: Vec<RawRecord>) -> Vec<BlockRange> {
        let now = Instant::now();
        records
            .into_iter()
            .flat_map(|r| p.handle(r, now).unwrap())
            .collect()
    }

    fn write_jsonl(dir: &TempDir, records: &[RawRecord]) -> std::path::PathBuf {
        let path = dir.path().join("records.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        for r in records {
            writeln!(file, "{}", serde_json::to_string(r).unwrap()).unwrap();
        }
        path
    }

    fn jsonl_worker(storage: &Storage, input: std::path::PathBuf) -> Worker {
        let key = SourceKey::new("replay", 1);
        let source = Source::Jsonl(JsonlSource::new(
            key.clone(),
            JsonlConfig {
                input,
                start_block: 100,
                ..Default::default()
            },
        ));
        let lock = ReconciliationLocks::default().lock_for(&key);
        Worker::new(source, storage.clone(), decoder(), config(), lock)
    }

    #[test]
    fn test_processor_commits_in_order() {
        let storage = Storage::in_memory();
        let mut p = processor(&storage);
        assert_eq!(p.resume_from(), None);

        assert!(feed(&mut p, chain(100..=103)).is_empty());
        let summary = p.flush().unwrap().unwrap();
        assert_eq!(summary.range, BlockRange::new(100, 103).unwrap());
        assert_eq!(summary.raw_inserted, 8);
        assert_eq!(p.checkpoint().unwrap().block_number(), Some(103));
        assert_eq!(p.stats().accepted, 8);
    }

    #[test]
    fn test_processor_drops_redelivery_and_stale() {
        let storage = Storage::in_memory();
        let mut p = processor(&storage);
        feed(&mut p, chain(100..=101));
        feed(&mut p, chain(100..=101));
        // below the configured start block
        feed(&mut p, chain(99..=99));
        p.flush().unwrap();

        assert_eq!(p.stats().duplicates, 4);
        assert_eq!(p.stats().stale, 2);
        assert_eq!(p.stats().accepted, 4);
    }

    #[test]
    fn test_processor_buffers_gap_and_backfills_after_timeout() {
        let storage = Storage::in_memory();
        let mut p = processor(&storage);
        feed(&mut p, chain(100..=100));
        feed(&mut p, chain(103..=103));
        assert_eq!(p.gap(), Some(BlockRange::new(101, 102).unwrap()));

        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(
            p.tick(later).unwrap(),
            vec![BlockRange::new(101, 102).unwrap()]
        );

        // backfill arrives; buffered block 103 drains behind it
        feed(&mut p, chain(101..=102));
        assert_eq!(p.gap(), None);
        p.flush().unwrap();
        assert_eq!(p.checkpoint().unwrap().block_number(), Some(103));
    }

    #[test]
    fn test_processor_reorg_requests_replay() {
        let storage = Storage::in_memory();
        let mut p = processor(&storage);
        feed(&mut p, chain(100..=103));
        p.flush().unwrap();

        let fork = BlockHash::from_low_u64(1101);
        let requests = feed(&mut p, block(101, fork, hash(100)));
        assert_eq!(requests, vec![BlockRange::new(101, 103).unwrap()]);
        assert!(!p.reconcile_state().is_stable());
        assert_eq!(p.checkpoint().unwrap().block_number(), Some(100));

        let retracted = storage
            .raw
            .scan(1, BlockRange::new(101, 103).unwrap())
            .unwrap()
            .into_iter()
            .filter(|s| s.retracted)
            .count();
        assert_eq!(retracted, 6);
    }

    #[test]
    fn test_processor_resumes_at_checkpoint_head() {
        let storage = Storage::in_memory();
        {
            let mut p = processor(&storage);
            feed(&mut p, chain(100..=102));
            p.flush().unwrap();
        }

        let mut p = processor(&storage);
        assert_eq!(p.resume_from(), Some(102));
        // the head block is redelivered and absorbed by the raw store
        feed(&mut p, chain(102..=104));
        let summary = p.flush().unwrap().unwrap();
        assert_eq!(summary.raw_duplicates, 2);
        assert_eq!(summary.raw_inserted, 4);
        assert_eq!(summary.checkpoint.block_number(), Some(104));
    }

    #[tokio::test]
    async fn test_worker_completes_finite_source() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::in_memory();
        let worker = jsonl_worker(&storage, write_jsonl(&dir, &chain(100..=105)));

        let report = worker.run(CancellationToken::new()).await;
        assert_eq!(report.outcome, WorkerOutcome::Completed);
        assert_eq!(report.checkpoint.unwrap().block_number(), Some(105));
    }

    #[tokio::test]
    async fn test_worker_backfills_gap_in_finite_source() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::in_memory();
        let mut records = chain(100..=101);
        records.extend(chain(103..=104));
        // block 102 arrives after the blocks above it
        records.extend(chain(102..=102));
        let worker = jsonl_worker(&storage, write_jsonl(&dir, &records));

        let report = worker.run(CancellationToken::new()).await;
        assert_eq!(report.outcome, WorkerOutcome::Completed);
        assert_eq!(report.checkpoint.unwrap().block_number(), Some(104));
    }

    #[tokio::test]
    async fn test_worker_halts_on_integrity_fault() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::in_memory();
        let mut records = chain(100..=100);
        records.insert(1, record(100, hash(100), hash(99), 0, br#"{"logs":[{}]}"#));
        let worker = jsonl_worker(&storage, write_jsonl(&dir, &records));

        let report = worker.run(CancellationToken::new()).await;
        assert!(report.is_halted(), "{:?}", report.outcome);
        assert!(report.checkpoint.and_then(|c| c.head).is_none());
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancel() {
        let storage = Storage::in_memory();
        let key = SourceKey::new("hist", 1);
        let source = Source::Historical(crate::source::HistoricalSource::new(
            key.clone(),
            crate::source::HistoricalConfig {
                endpoint: "http://127.0.0.1:1".into(),
                request_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        ));
        let lock = ReconciliationLocks::default().lock_for(&key);
        let worker = Worker::new(source, storage, decoder(), config(), lock);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let report = handle.await.unwrap();
        assert_eq!(report.outcome, WorkerOutcome::Stopped);
        assert!(report.checkpoint.is_none());
    }
}
