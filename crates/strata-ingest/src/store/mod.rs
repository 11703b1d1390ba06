//! Storage interfaces for the bronze (raw) and silver (normalized) tiers,
//! checkpoints, and the write-ahead batch journal.
//!
//! # Write-ahead batches
//!
//! Every write goes through a batch id. `put(batch, ..)` stages a record
//! where readers cannot see it; `discard(batch)` drops it. The
//! [`BatchJournal`] records each batch's header with a `pending` marker
//! before anything is staged and flips it to `finalized` once the batch is
//! durable, so recovery can tell which batches to roll forward and which to
//! drop.
//!
//! An ingest batch becomes visible through [`BatchPublisher::publish`],
//! which lands the staged raw records, the staged normalized records and the
//! checkpoint compare-and-set as one atomic step. Readers see the whole
//! batch with its checkpoint, or none of it.
//!
//! ```text
//! journal.open(pending) → raw.put* → normalized.put* → journal.finalize
//!     → publish(raw + normalized + checkpoint CAS) → journal.close
//! ```
//!
//! Two backends implement all five interfaces:
//!
//! - [`memory`] - in-process maps, for tests and embedding
//! - [`rocks`] - a single RocksDB database, for production

pub mod memory;
pub mod rocks;
#[cfg(test)]
pub(crate) mod testing;

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use strata_core::{
    BlockPointer, BlockRange, ChainId, Checkpoint, DecodeStatus, IdentityKey, NormalizedRecord,
    RawRecord, SourceKey,
};

pub use memory::MemoryStore;
pub use rocks::RocksStore;

/// Identifier of a write-ahead batch.
pub type BatchId = u64;

/// Result of staging a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New record staged.
    Inserted,
    /// Identical record already present; nothing staged.
    Duplicate,
    /// A differing record exists and will be replaced on finalize.
    Replaced,
}

/// A stored record with its retraction flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stored<T> {
    pub record: T,
    pub retracted: bool,
}

/// Append-only store of raw records.
pub trait RawStore: Send + Sync {
    /// Stage a record under `batch`.
    ///
    /// A live record with the same identity key and payload yields
    /// [`PutOutcome::Duplicate`]; a differing payload is an
    /// [`Error::IntegrityFault`](crate::Error::IntegrityFault). A retracted
    /// record with the same key is revived on finalize, whichever source
    /// retracted it.
    fn put(&self, batch: BatchId, record: &RawRecord) -> Result<PutOutcome>;

    /// Publish every record staged under `batch`. Returns the count.
    fn finalize(&self, batch: BatchId) -> Result<usize>;

    /// Drop every record staged under `batch`. Returns the count.
    fn discard(&self, batch: BatchId) -> Result<usize>;

    /// Mark a published record retracted. Returns false if it was absent or
    /// already retracted.
    fn mark_retracted(&self, key: &IdentityKey) -> Result<bool>;

    fn get(&self, key: &IdentityKey) -> Result<Option<Stored<RawRecord>>>;

    /// Published records (retracted included) in block order.
    fn scan(&self, chain_id: ChainId, range: BlockRange) -> Result<Vec<Stored<RawRecord>>>;
}

/// Store of normalized records; the read contract for downstream consumers.
pub trait NormalizedStore: Send + Sync {
    /// Stage a record under `batch`, replacing any record with the same
    /// identity key and ordinal on finalize.
    fn put(&self, batch: BatchId, record: &NormalizedRecord) -> Result<PutOutcome>;

    fn finalize(&self, batch: BatchId) -> Result<usize>;

    fn discard(&self, batch: BatchId) -> Result<usize>;

    /// Retract every ordinal decoded from `key`. Returns how many changed.
    fn mark_retracted(&self, key: &IdentityKey) -> Result<usize>;

    /// All ordinals stored for `key`, retracted included.
    fn get(&self, key: &IdentityKey) -> Result<Vec<Stored<NormalizedRecord>>>;

    /// Live records in `range`, optionally filtered by status, in block order.
    fn query(
        &self,
        chain_id: ChainId,
        range: BlockRange,
        status: Option<DecodeStatus>,
    ) -> Result<Vec<NormalizedRecord>>;
}

/// Outcome of a checkpoint compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write landed; carries the stored checkpoint (with its new version).
    Applied(Checkpoint),
    /// The expected value did not match; carries the current value.
    Conflict(Option<Checkpoint>),
}

/// Versioned checkpoint store, shared across workers.
pub trait CheckpointStore: Send + Sync {
    fn get(&self, key: &SourceKey) -> Result<Option<Checkpoint>>;

    /// Replace the checkpoint if its version still matches `expected`
    /// (`None` meaning no checkpoint yet). The stored copy gets
    /// `version = expected.version + 1`.
    fn compare_and_set(
        &self,
        key: &SourceKey,
        expected: Option<&Checkpoint>,
        new: Checkpoint,
    ) -> Result<CasOutcome>;

    fn list(&self) -> Result<Vec<Checkpoint>>;
}

/// Atomic publication of an ingest batch.
pub trait BatchPublisher: Send + Sync {
    /// Publish everything staged under `batch` together with a
    /// compare-and-set of `source`'s checkpoint to `next`. On
    /// [`CasOutcome::Conflict`] nothing is published and the batch stays
    /// staged.
    fn publish(
        &self,
        batch: BatchId,
        source: &SourceKey,
        expected: Option<&Checkpoint>,
        next: Checkpoint,
    ) -> Result<CasOutcome>;
}

/// What a batch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    /// Records from a source; advances the checkpoint.
    Ingest,
    /// Re-decoded quarantined records; normalized store only.
    Reprocess,
}

/// Journal state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Pending,
    Finalized,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchState::Pending => f.write_str("pending"),
            BatchState::Finalized => f.write_str("finalized"),
        }
    }
}

/// Header written with the pending marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub id: BatchId,
    pub source: SourceKey,
    pub kind: BatchKind,

    /// Blocks covered by the batch.
    pub range: Option<BlockRange>,

    /// First block to request again if the batch has to be dropped.
    pub replay_from: Option<u64>,

    /// Checkpoint observed when the batch was opened.
    pub previous: Option<Checkpoint>,

    /// Head the checkpoint advances to once the batch is finalized.
    pub target: Option<BlockPointer>,

    pub raw_count: usize,
    pub normalized_count: usize,
    pub opened_at: DateTime<Utc>,
}

/// A journal entry as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub header: BatchHeader,
    pub state: BatchState,
}

/// Write-ahead journal of batch markers.
pub trait BatchJournal: Send + Sync {
    /// Allocate a fresh, never reused, batch id.
    fn next_batch_id(&self) -> Result<BatchId>;

    /// Durably record `header` with a pending marker.
    fn open(&self, header: &BatchHeader) -> Result<()>;

    /// Flip the marker to finalized. This is the commit point.
    fn finalize(&self, id: BatchId) -> Result<()>;

    /// Remove the entry once its effects are fully applied or dropped.
    fn close(&self, id: BatchId) -> Result<()>;

    /// Open entries for `source`, oldest first.
    fn entries(&self, source: &SourceKey) -> Result<Vec<JournalEntry>>;
}

/// The storage interfaces bundled for the pipeline.
#[derive(Clone)]
pub struct Storage {
    pub raw: Arc<dyn RawStore>,
    pub normalized: Arc<dyn NormalizedStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub journal: Arc<dyn BatchJournal>,
    pub publisher: Arc<dyn BatchPublisher>,
}

impl Storage {
    /// Fresh in-memory storage.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::default());
        Self {
            raw: store.clone(),
            normalized: store.clone(),
            checkpoints: store.clone(),
            journal: store.clone(),
            publisher: store,
        }
    }

    /// Open (or create) a RocksDB-backed store at `path`.
    pub fn open_rocks<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Arc::new(RocksStore::open(path)?);
        Ok(Self::from_rocks(store))
    }

    /// Use one RocksDB store for every interface.
    pub fn from_rocks(store: Arc<RocksStore>) -> Self {
        Self {
            raw: store.clone(),
            normalized: store.clone(),
            checkpoints: store.clone(),
            journal: store.clone(),
            publisher: store,
        }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

// Rules shared by both backends.

/// Decide how a raw record lands against whatever already holds its key.
pub(crate) fn raw_put_outcome(
    existing: Option<&Stored<RawRecord>>,
    record: &RawRecord,
) -> Result<PutOutcome> {
    match existing {
        Some(stored) if !stored.retracted => {
            if stored.record.fingerprint() == record.fingerprint() {
                Ok(PutOutcome::Duplicate)
            } else {
                Err(crate::Error::IntegrityFault {
                    key: record.identity_key(),
                    detail: format!(
                        "payload fingerprint {} differs from stored {} (source {})",
                        hex::encode(record.fingerprint()),
                        hex::encode(stored.record.fingerprint()),
                        record.source_id
                    ),
                })
            }
        }
        // retracted records are revived; retraction is not tied to a source
        _ => Ok(PutOutcome::Inserted),
    }
}

pub(crate) fn normalized_put_outcome(
    existing: Option<&Stored<NormalizedRecord>>,
    record: &NormalizedRecord,
) -> PutOutcome {
    match existing {
        Some(stored) if !stored.retracted && stored.record == *record => PutOutcome::Duplicate,
        Some(stored) if !stored.retracted => PutOutcome::Replaced,
        _ => PutOutcome::Inserted,
    }
}

/// Versions compare with "absent" treated as version 0.
pub(crate) fn cas_apply(
    current: Option<&Checkpoint>,
    expected: Option<&Checkpoint>,
    mut new: Checkpoint,
) -> CasOutcome {
    let current_version = current.map_or(0, |c| c.version);
    let expected_version = expected.map_or(0, |c| c.version);
    if current_version != expected_version {
        return CasOutcome::Conflict(current.cloned());
    }
    new.version = current_version + 1;
    CasOutcome::Applied(new)
}
