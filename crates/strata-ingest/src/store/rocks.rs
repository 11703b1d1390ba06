//! RocksDB storage backend.
//!
//! One database holds every interface, separated by a one-byte key
//! prefix. Numbers are big-endian so iteration order follows block order.
//!
//! # Key Design
//!
//! ```text
//! r | chain(8) | block(8) | hash(32) | seq(8)               → Stored<RawRecord>
//! k | chain(8) | hash(32) | seq(8)                         → block(8)
//! n | chain(8) | block(8) | hash(32) | seq(8) | ordinal(4) → Stored<NormalizedRecord>
//! s | batch(8) | r | chain(8) | hash(32) | seq(8)          → RawRecord (staged)
//! s | batch(8) | n | chain(8) | hash(32) | seq(8) | ord(4) → NormalizedRecord (staged)
//! c | source_id | 0x00 | chain(8)                         → Checkpoint
//! b | batch(8)                                            → JournalEntry
//! m | next_batch                                          → batch(8)
//! ```
//!
//! Values are JSON. Staged records live under their batch id, so `finalize`
//! and `discard` are a single prefix scan plus one `WriteBatch`. `publish`
//! puts both tiers' staged records and the checkpoint into that same
//! `WriteBatch`.

use super::{
    BatchHeader, BatchId, BatchJournal, BatchPublisher, BatchState, CasOutcome, CheckpointStore,
    JournalEntry, NormalizedStore, PutOutcome, RawStore, Stored, cas_apply,
    normalized_put_outcome, raw_put_outcome,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use strata_core::{
    BlockRange, ChainId, Checkpoint, DecodeStatus, IdentityKey, NormalizedRecord, RawRecord,
    SourceKey,
};
use tracing::{debug, info};

const RAW: u8 = b'r';
const KEY_INDEX: u8 = b'k';
const NORMALIZED: u8 = b'n';
const STAGED: u8 = b's';
const CHECKPOINT: u8 = b'c';
const JOURNAL: u8 = b'b';

const NEXT_BATCH_KEY: &[u8] = b"mnext_batch";

/// RocksDB-backed implementation of every storage interface.
///
/// Thread-safe; share it via `Arc<RocksStore>`. Read-modify-write paths
/// (puts, retractions, CAS, finalize) serialize on an internal mutex.
pub struct RocksStore {
    db: DBWithThreadMode<MultiThreaded>,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening RocksDB store at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);

        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);

        // Bloom filters for point lookups on the key index
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        opts.increase_parallelism(num_cpus::get().min(8) as i32);
        opts.set_max_background_jobs(4);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Approximate number of keys across all prefixes.
    pub fn approximate_count(&self) -> Result<u64> {
        Ok(self
            .db
            .property_int_value("rocksdb.estimate-num-keys")?
            .unwrap_or(0))
    }

    // -------------------------------------------------------------------------
    // Key construction
    // -------------------------------------------------------------------------

    fn identity_bytes(key: &IdentityKey, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.chain_id.to_be_bytes());
        out.extend_from_slice(key.block_hash.as_bytes());
        out.extend_from_slice(&key.sequence_index.to_be_bytes());
    }

    fn parse_identity(bytes: &[u8]) -> Option<IdentityKey> {
        if bytes.len() < 48 {
            return None;
        }
        let chain_id = u64::from_be_bytes(bytes[0..8].try_into().ok()?);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[8..40]);
        let sequence_index = u64::from_be_bytes(bytes[40..48].try_into().ok()?);
        Some(IdentityKey {
            chain_id,
            block_hash: strata_core::BlockHash(hash),
            sequence_index,
        })
    }

    fn raw_key(key: &IdentityKey, block: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(57);
        out.push(RAW);
        out.extend_from_slice(&key.chain_id.to_be_bytes());
        out.extend_from_slice(&block.to_be_bytes());
        out.extend_from_slice(key.block_hash.as_bytes());
        out.extend_from_slice(&key.sequence_index.to_be_bytes());
        out
    }

    fn index_key(key: &IdentityKey) -> Vec<u8> {
        let mut out = Vec::with_capacity(49);
        out.push(KEY_INDEX);
        Self::identity_bytes(key, &mut out);
        out
    }

    /// Prefix of every normalized ordinal for `key`.
    fn normalized_prefix(key: &IdentityKey, block: u64) -> Vec<u8> {
        let mut out = Self::raw_key(key, block);
        out[0] = NORMALIZED;
        out
    }

    fn normalized_key(key: &IdentityKey, block: u64, ordinal: u32) -> Vec<u8> {
        let mut out = Self::normalized_prefix(key, block);
        out.extend_from_slice(&ordinal.to_be_bytes());
        out
    }

    fn staged_prefix(batch: BatchId, kind: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(62);
        out.push(STAGED);
        out.extend_from_slice(&batch.to_be_bytes());
        out.push(kind);
        out
    }

    fn staged_raw_key(batch: BatchId, key: &IdentityKey) -> Vec<u8> {
        let mut out = Self::staged_prefix(batch, RAW);
        Self::identity_bytes(key, &mut out);
        out
    }

    fn staged_normalized_key(batch: BatchId, key: &IdentityKey, ordinal: u32) -> Vec<u8> {
        let mut out = Self::staged_prefix(batch, NORMALIZED);
        Self::identity_bytes(key, &mut out);
        out.extend_from_slice(&ordinal.to_be_bytes());
        out
    }

    fn checkpoint_key(key: &SourceKey) -> Vec<u8> {
        let mut out = Vec::with_capacity(key.source_id.len() + 10);
        out.push(CHECKPOINT);
        out.extend_from_slice(key.source_id.as_bytes());
        out.push(0);
        out.extend_from_slice(&key.chain_id.to_be_bytes());
        out
    }

    fn journal_key(id: BatchId) -> [u8; 9] {
        let mut out = [0u8; 9];
        out[0] = JOURNAL;
        out[1..].copy_from_slice(&id.to_be_bytes());
        out
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(batch: &mut WriteBatch, key: &[u8], value: &T) -> Result<()> {
        batch.put(key, serde_json::to_vec(value)?);
        Ok(())
    }

    fn write_synced(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// All `(key, value)` pairs under `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let mut out = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    fn block_of(&self, key: &IdentityKey) -> Result<Option<u64>> {
        match self.db.get(Self::index_key(key))? {
            Some(bytes) if bytes.len() == 8 => {
                let mut be = [0u8; 8];
                be.copy_from_slice(&bytes);
                Ok(Some(u64::from_be_bytes(be)))
            }
            Some(_) => Err(Error::Batch(format!("corrupt key index entry for {}", key))),
            None => Ok(None),
        }
    }

    fn get_raw(&self, key: &IdentityKey) -> Result<Option<Stored<RawRecord>>> {
        match self.block_of(key)? {
            Some(block) => self.get_json(&Self::raw_key(key, block)),
            None => Ok(None),
        }
    }

    /// Move raw records staged under `batch` to their visible keys in `wb`.
    /// The caller holds `write_lock`.
    fn publish_raw(&self, batch: BatchId, wb: &mut WriteBatch) -> Result<usize> {
        let staged = self.scan_prefix(&Self::staged_prefix(batch, RAW))?;
        for (staged_key, value) in &staged {
            let record: RawRecord = serde_json::from_slice(value)?;
            let key = record.identity_key();
            let stored = Stored {
                record,
                retracted: false,
            };
            Self::put_json(wb, &Self::raw_key(&key, stored.record.block_number), &stored)?;
            wb.put(Self::index_key(&key), stored.record.block_number.to_be_bytes());
            wb.delete(staged_key);
        }
        Ok(staged.len())
    }

    /// Same as [`publish_raw`](Self::publish_raw) for normalized records.
    fn publish_normalized(&self, batch: BatchId, wb: &mut WriteBatch) -> Result<usize> {
        let staged = self.scan_prefix(&Self::staged_prefix(batch, NORMALIZED))?;
        for (staged_key, value) in &staged {
            let record: NormalizedRecord = serde_json::from_slice(value)?;
            let visible_key = Self::normalized_key(&record.key, record.block_number, record.ordinal);
            // keeps the key index populated for reprocess-only batches
            wb.put(Self::index_key(&record.key), record.block_number.to_be_bytes());
            Self::put_json(
                wb,
                &visible_key,
                &Stored {
                    record,
                    retracted: false,
                },
            )?;
            wb.delete(staged_key);
        }
        Ok(staged.len())
    }
}

impl RawStore for RocksStore {
    fn put(&self, batch: BatchId, record: &RawRecord) -> Result<PutOutcome> {
        let key = record.identity_key();
        let staged_key = Self::staged_raw_key(batch, &key);
        let _guard = self.write_lock.lock();

        if let Some(staged) = self.get_json::<RawRecord>(&staged_key)? {
            let pending = Stored {
                record: staged,
                retracted: false,
            };
            return raw_put_outcome(Some(&pending), record);
        }

        let existing = self.get_raw(&key)?;
        let outcome = raw_put_outcome(existing.as_ref(), record)?;
        if outcome != PutOutcome::Duplicate {
            self.db.put(staged_key, serde_json::to_vec(record)?)?;
        }
        Ok(outcome)
    }

    fn finalize(&self, batch: BatchId) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut wb = WriteBatch::default();
        let count = self.publish_raw(batch, &mut wb)?;
        if count > 0 {
            self.write_synced(wb)?;
            debug!("Finalized {} raw records for batch {}", count, batch);
        }
        Ok(count)
    }

    fn discard(&self, batch: BatchId) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let staged = self.scan_prefix(&Self::staged_prefix(batch, RAW))?;
        let mut wb = WriteBatch::default();
        for (staged_key, _) in &staged {
            wb.delete(staged_key);
        }
        if !staged.is_empty() {
            self.write_synced(wb)?;
        }
        Ok(staged.len())
    }

    fn mark_retracted(&self, key: &IdentityKey) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let Some(block) = self.block_of(key)? else {
            return Ok(false);
        };
        let raw_key = Self::raw_key(key, block);
        let Some(mut stored) = self.get_json::<Stored<RawRecord>>(&raw_key)? else {
            return Ok(false);
        };
        if stored.retracted {
            return Ok(false);
        }
        stored.retracted = true;
        self.db.put(raw_key, serde_json::to_vec(&stored)?)?;
        Ok(true)
    }

    fn get(&self, key: &IdentityKey) -> Result<Option<Stored<RawRecord>>> {
        self.get_raw(key)
    }

    fn scan(&self, chain_id: ChainId, range: BlockRange) -> Result<Vec<Stored<RawRecord>>> {
        let mut start = vec![RAW];
        start.extend_from_slice(&chain_id.to_be_bytes());
        start.extend_from_slice(&range.start.to_be_bytes());
        let chain_prefix = &start[..9];

        let mut out = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(chain_prefix) || key.len() < 17 {
                break;
            }
            let block = u64::from_be_bytes(key[9..17].try_into().unwrap_or([0xff; 8]));
            if block > range.end {
                break;
            }
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }
}

impl NormalizedStore for RocksStore {
    fn put(&self, batch: BatchId, record: &NormalizedRecord) -> Result<PutOutcome> {
        let _guard = self.write_lock.lock();
        let visible_key = Self::normalized_key(&record.key, record.block_number, record.ordinal);
        let existing = self.get_json::<Stored<NormalizedRecord>>(&visible_key)?;
        let outcome = normalized_put_outcome(existing.as_ref(), record);
        if outcome != PutOutcome::Duplicate {
            self.db.put(
                Self::staged_normalized_key(batch, &record.key, record.ordinal),
                serde_json::to_vec(record)?,
            )?;
        }
        Ok(outcome)
    }

    fn finalize(&self, batch: BatchId) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut wb = WriteBatch::default();
        let count = self.publish_normalized(batch, &mut wb)?;
        if count > 0 {
            self.write_synced(wb)?;
            debug!("Finalized {} normalized records for batch {}", count, batch);
        }
        Ok(count)
    }

    fn discard(&self, batch: BatchId) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let staged = self.scan_prefix(&Self::staged_prefix(batch, NORMALIZED))?;
        let mut wb = WriteBatch::default();
        for (staged_key, _) in &staged {
            wb.delete(staged_key);
        }
        if !staged.is_empty() {
            self.write_synced(wb)?;
        }
        Ok(staged.len())
    }

    fn mark_retracted(&self, key: &IdentityKey) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let Some(block) = self.block_of(key)? else {
            return Ok(0);
        };
        let mut wb = WriteBatch::default();
        let mut changed = 0;
        for (visible_key, value) in self.scan_prefix(&Self::normalized_prefix(key, block))? {
            let mut stored: Stored<NormalizedRecord> = serde_json::from_slice(&value)?;
            if !stored.retracted {
                stored.retracted = true;
                Self::put_json(&mut wb, &visible_key, &stored)?;
                changed += 1;
            }
        }
        if changed > 0 {
            self.db.write(wb)?;
        }
        Ok(changed)
    }

    fn get(&self, key: &IdentityKey) -> Result<Vec<Stored<NormalizedRecord>>> {
        let Some(block) = self.block_of(key)? else {
            return Ok(Vec::new());
        };
        self.scan_prefix(&Self::normalized_prefix(key, block))?
            .into_iter()
            .map(|(_, value)| Ok(serde_json::from_slice(&value)?))
            .collect()
    }

    fn query(
        &self,
        chain_id: ChainId,
        range: BlockRange,
        status: Option<DecodeStatus>,
    ) -> Result<Vec<NormalizedRecord>> {
        let mut start = vec![NORMALIZED];
        start.extend_from_slice(&chain_id.to_be_bytes());
        start.extend_from_slice(&range.start.to_be_bytes());
        let chain_prefix = &start[..9];

        let mut out = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(chain_prefix) || key.len() < 17 {
                break;
            }
            let block = u64::from_be_bytes(key[9..17].try_into().unwrap_or([0xff; 8]));
            if block > range.end {
                break;
            }
            let stored: Stored<NormalizedRecord> = serde_json::from_slice(&value)?;
            if stored.retracted {
                continue;
            }
            if status.is_some_and(|s| stored.record.decode_status != s) {
                continue;
            }
            out.push(stored.record);
        }
        Ok(out)
    }
}

impl CheckpointStore for RocksStore {
    fn get(&self, key: &SourceKey) -> Result<Option<Checkpoint>> {
        self.get_json(&Self::checkpoint_key(key))
    }

    fn compare_and_set(
        &self,
        key: &SourceKey,
        expected: Option<&Checkpoint>,
        new: Checkpoint,
    ) -> Result<CasOutcome> {
        let storage_key = Self::checkpoint_key(key);
        let _guard = self.write_lock.lock();
        let current: Option<Checkpoint> = self.get_json(&storage_key)?;
        let outcome = cas_apply(current.as_ref(), expected, new);
        if let CasOutcome::Applied(stored) = &outcome {
            let mut wb = WriteBatch::default();
            Self::put_json(&mut wb, &storage_key, stored)?;
            self.write_synced(wb)?;
        }
        Ok(outcome)
    }

    fn list(&self) -> Result<Vec<Checkpoint>> {
        self.scan_prefix(&[CHECKPOINT])?
            .into_iter()
            .map(|(_, value)| Ok(serde_json::from_slice(&value)?))
            .collect()
    }
}

impl BatchPublisher for RocksStore {
    fn publish(
        &self,
        batch: BatchId,
        source: &SourceKey,
        expected: Option<&Checkpoint>,
        next: Checkpoint,
    ) -> Result<CasOutcome> {
        let storage_key = Self::checkpoint_key(source);
        let _guard = self.write_lock.lock();
        let current: Option<Checkpoint> = self.get_json(&storage_key)?;
        let outcome = cas_apply(current.as_ref(), expected, next);
        if let CasOutcome::Applied(stored) = &outcome {
            let mut wb = WriteBatch::default();
            let raw = self.publish_raw(batch, &mut wb)?;
            let normalized = self.publish_normalized(batch, &mut wb)?;
            Self::put_json(&mut wb, &storage_key, stored)?;
            self.write_synced(wb)?;
            debug!(
                "Published batch {} for {} ({} raw, {} normalized, checkpoint v{})",
                batch, source, raw, normalized, stored.version
            );
        }
        Ok(outcome)
    }
}

impl BatchJournal for RocksStore {
    fn next_batch_id(&self) -> Result<BatchId> {
        let _guard = self.write_lock.lock();
        let current = match self.db.get(NEXT_BATCH_KEY)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut be = [0u8; 8];
                be.copy_from_slice(&bytes);
                u64::from_be_bytes(be)
            }
            _ => 0,
        };
        let next = current + 1;
        let mut wb = WriteBatch::default();
        wb.put(NEXT_BATCH_KEY, next.to_be_bytes());
        self.write_synced(wb)?;
        Ok(next)
    }

    fn open(&self, header: &BatchHeader) -> Result<()> {
        let key = Self::journal_key(header.id);
        let _guard = self.write_lock.lock();
        if self.db.get(key)?.is_some() {
            return Err(Error::Batch(format!("batch {} already open", header.id)));
        }
        let mut wb = WriteBatch::default();
        Self::put_json(
            &mut wb,
            &key,
            &JournalEntry {
                header: header.clone(),
                state: BatchState::Pending,
            },
        )?;
        self.write_synced(wb)
    }

    fn finalize(&self, id: BatchId) -> Result<()> {
        let key = Self::journal_key(id);
        let _guard = self.write_lock.lock();
        let Some(mut entry) = self.get_json::<JournalEntry>(&key)? else {
            return Err(Error::Batch(format!("batch {} not in journal", id)));
        };
        entry.state = BatchState::Finalized;
        let mut wb = WriteBatch::default();
        Self::put_json(&mut wb, &key, &entry)?;
        self.write_synced(wb)
    }

    fn close(&self, id: BatchId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut wb = WriteBatch::default();
        wb.delete(Self::journal_key(id));
        self.write_synced(wb)
    }

    fn entries(&self, source: &SourceKey) -> Result<Vec<JournalEntry>> {
        let mut out = Vec::new();
        for (_, value) in self.scan_prefix(&[JOURNAL])? {
            let entry: JournalEntry = serde_json::from_slice(&value)?;
            if entry.header.source == *source {
                out.push(entry);
            }
        }
        Ok(out)
    }
}

impl RocksStore {
    /// Batch ids that still have staged records, with identity keys.
    pub fn staged_batches(&self) -> Result<Vec<(BatchId, IdentityKey)>> {
        let mut out = Vec::new();
        for (key, _) in self.scan_prefix(&[STAGED])? {
            if key.len() < 10 {
                continue;
            }
            let mut be = [0u8; 8];
            be.copy_from_slice(&key[1..9]);
            if let Some(identity) = Self::parse_identity(&key[10..]) {
                out.push((u64::from_be_bytes(be), identity));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BatchKind;
    use chrono::Utc;
    use strata_core::{BlockHash, BlockPointer};
    use tempfile::TempDir;

    fn raw(chain: ChainId, block: u64, seq: u64, payload: &[u8]) -> RawRecord {
        RawRecord {
            source_id: "test".into(),
            chain_id: chain,
            block_number: block,
            block_hash: BlockHash::from_low_u64(block),
            parent_hash: None,
            sequence_index: seq,
            payload: payload.to_vec(),
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn test_open_and_close() {
        let tmp = TempDir::new().unwrap();
        let _store = RocksStore::open(tmp.path()).unwrap();
    }

    #[test]
    fn test_raw_stage_finalize_and_scan() {
        let tmp = TempDir::new().unwrap();
        let store = RocksStore::open(tmp.path()).unwrap();

        for block in [102, 100, 101] {
            assert_eq!(
                RawStore::put(&store, 5, &raw(1, block, 0, b"p")).unwrap(),
                PutOutcome::Inserted
            );
        }
        // other chains never leak into a scan
        RawStore::put(&store, 5, &raw(2, 100, 0, b"p")).unwrap();

        assert!(RawStore::scan(&store, 1, BlockRange::from(0)).unwrap().is_empty());
        assert_eq!(RawStore::finalize(&store, 5).unwrap(), 4);
        assert!(store.staged_batches().unwrap().is_empty());

        let blocks: Vec<u64> = RawStore::scan(&store, 1, BlockRange::new(100, 101).unwrap())
            .unwrap()
            .iter()
            .map(|s| s.record.block_number)
            .collect();
        assert_eq!(blocks, vec![100, 101]);
    }

    #[test]
    fn test_raw_integrity_and_retraction() {
        let tmp = TempDir::new().unwrap();
        let store = RocksStore::open(tmp.path()).unwrap();
        let record = raw(1, 100, 3, b"a");

        RawStore::put(&store, 1, &record).unwrap();
        RawStore::finalize(&store, 1).unwrap();

        assert_eq!(
            RawStore::put(&store, 2, &record).unwrap(),
            PutOutcome::Duplicate
        );
        assert!(matches!(
            RawStore::put(&store, 2, &raw(1, 100, 3, b"b")),
            Err(Error::IntegrityFault { .. })
        ));

        let key = record.identity_key();
        assert!(RawStore::mark_retracted(&store, &key).unwrap());
        assert!(RawStore::get(&store, &key).unwrap().unwrap().retracted);
        assert!(!RawStore::mark_retracted(&store, &key).unwrap());
    }

    #[test]
    fn test_discard_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let store = RocksStore::open(tmp.path()).unwrap();
        let record = raw(1, 100, 0, b"a");
        let normalized =
            NormalizedRecord::quarantined(record.identity_key(), 0, 100, b"a".to_vec(), "x");

        RawStore::put(&store, 9, &record).unwrap();
        NormalizedStore::put(&store, 9, &normalized).unwrap();
        assert_eq!(store.staged_batches().unwrap().len(), 2);

        assert_eq!(RawStore::discard(&store, 9).unwrap(), 1);
        assert_eq!(NormalizedStore::discard(&store, 9).unwrap(), 1);
        assert!(store.staged_batches().unwrap().is_empty());
        assert!(RawStore::get(&store, &record.identity_key()).unwrap().is_none());
    }

    #[test]
    fn test_normalized_query_and_cascade() {
        let tmp = TempDir::new().unwrap();
        let store = RocksStore::open(tmp.path()).unwrap();
        let record = raw(1, 100, 0, b"a");
        let key = record.identity_key();

        RawStore::put(&store, 1, &record).unwrap();
        for ordinal in 0..3 {
            let n = NormalizedRecord::quarantined(key, ordinal, 100, b"a".to_vec(), "x");
            NormalizedStore::put(&store, 1, &n).unwrap();
        }
        RawStore::finalize(&store, 1).unwrap();
        NormalizedStore::finalize(&store, 1).unwrap();

        let range = BlockRange::single(100);
        assert_eq!(
            NormalizedStore::query(&store, 1, range, Some(DecodeStatus::Quarantined))
                .unwrap()
                .len(),
            3
        );
        assert!(
            NormalizedStore::query(&store, 1, range, Some(DecodeStatus::Ok))
                .unwrap()
                .is_empty()
        );

        assert_eq!(NormalizedStore::mark_retracted(&store, &key).unwrap(), 3);
        assert!(NormalizedStore::query(&store, 1, range, None).unwrap().is_empty());
        assert_eq!(NormalizedStore::get(&store, &key).unwrap().len(), 3);
    }

    #[test]
    fn test_checkpoint_cas_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let key = SourceKey::new("hist", 1);
        {
            let store = RocksStore::open(tmp.path()).unwrap();
            let mut cp = Checkpoint::empty(&key);
            cp.head = Some(BlockPointer::new(103, BlockHash::from_low_u64(103)));
            let outcome = store.compare_and_set(&key, None, cp.clone()).unwrap();
            assert!(matches!(outcome, CasOutcome::Applied(ref c) if c.version == 1));
            assert!(matches!(
                store.compare_and_set(&key, None, cp).unwrap(),
                CasOutcome::Conflict(Some(_))
            ));
        }

        let store = RocksStore::open(tmp.path()).unwrap();
        let cp = CheckpointStore::get(&store, &key).unwrap().unwrap();
        assert_eq!(cp.block_number(), Some(103));
        assert_eq!(cp.version, 1);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_publish_is_one_write() {
        let tmp = TempDir::new().unwrap();
        let source = SourceKey::new("hist", 1);
        let record = raw(1, 100, 0, b"a");
        let key = record.identity_key();
        let mut next = Checkpoint::empty(&source);
        next.head = Some(record.pointer());
        {
            let store = RocksStore::open(tmp.path()).unwrap();
            RawStore::put(&store, 3, &record).unwrap();
            NormalizedStore::put(
                &store,
                3,
                &NormalizedRecord::quarantined(key, 0, 100, b"a".to_vec(), "x"),
            )
            .unwrap();

            // a stale expectation publishes nothing
            let mut other = Checkpoint::empty(&source);
            other.version = 7;
            assert!(matches!(
                store.publish(3, &source, Some(&other), next.clone()).unwrap(),
                CasOutcome::Conflict(None)
            ));
            assert!(RawStore::get(&store, &key).unwrap().is_none());
            assert!(NormalizedStore::get(&store, &key).unwrap().is_empty());
            assert!(CheckpointStore::get(&store, &source).unwrap().is_none());
            assert_eq!(store.staged_batches().unwrap().len(), 2);

            assert!(matches!(
                store.publish(3, &source, None, next).unwrap(),
                CasOutcome::Applied(ref c) if c.version == 1
            ));
        }

        let store = RocksStore::open(tmp.path()).unwrap();
        assert!(store.staged_batches().unwrap().is_empty());
        assert!(!RawStore::get(&store, &key).unwrap().unwrap().retracted);
        assert_eq!(
            NormalizedStore::query(&store, 1, BlockRange::single(100), None)
                .unwrap()
                .len(),
            1
        );
        let cp = CheckpointStore::get(&store, &source).unwrap().unwrap();
        assert_eq!(cp.head, Some(record.pointer()));
    }

    #[test]
    fn test_journal_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let source = SourceKey::new("ws", 1);
        let id = {
            let store = RocksStore::open(tmp.path()).unwrap();
            let id = store.next_batch_id().unwrap();
            let header = BatchHeader {
                id,
                source: source.clone(),
                kind: BatchKind::Ingest,
                range: Some(BlockRange::new(100, 103).unwrap()),
                replay_from: Some(100),
                previous: None,
                target: Some(BlockPointer::new(103, BlockHash::from_low_u64(103))),
                raw_count: 4,
                normalized_count: 0,
                opened_at: Utc::now(),
            };
            BatchJournal::open(&store, &header).unwrap();
            id
        };

        let store = RocksStore::open(tmp.path()).unwrap();
        let entries = store.entries(&source).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, BatchState::Pending);
        assert_eq!(entries[0].header.replay_from, Some(100));

        // ids are never reused across restarts
        assert!(store.next_batch_id().unwrap() > id);

        BatchJournal::finalize(&store, id).unwrap();
        assert_eq!(store.entries(&source).unwrap()[0].state, BatchState::Finalized);
        store.close(id).unwrap();
        assert!(store.entries(&source).unwrap().is_empty());
    }
}
