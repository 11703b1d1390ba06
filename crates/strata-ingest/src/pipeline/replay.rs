//! Re-decoding of quarantined records after schema updates.

use super::commit::CommitPipeline;
use super::decoder::Decoder;
use crate::Result;
use crate::store::Storage;
use std::collections::BTreeSet;
use strata_core::{BlockRange, ChainId, DecodeStatus, IdentityKey, metrics as core_metrics};
use tracing::{debug, info};

/// Outcome of a replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Raw records whose quarantined output was re-decoded.
    pub examined: usize,
    /// Normalized records that decode cleanly now.
    pub resolved: usize,
    /// Normalized records still quarantined after re-decoding.
    pub still_quarantined: usize,
    /// Normalized records rewritten.
    pub written: usize,
}

/// Re-runs the decoder over quarantined records and commits what changed.
pub struct QuarantineReplayer {
    storage: Storage,
    decoder: Decoder,
}

impl QuarantineReplayer {
    pub fn new(storage: Storage, decoder: Decoder) -> Self {
        Self { storage, decoder }
    }

    /// Replay every quarantined record on `chain_id` within `range`.
    ///
    /// The raw record is the input, never the quarantined copy, so the result
    /// is exactly what ingestion would produce today.
    pub fn replay(
        &self,
        chain_id: ChainId,
        range: BlockRange,
        commit: &mut CommitPipeline,
    ) -> Result<ReplayReport> {
        let keys: BTreeSet<IdentityKey> = self
            .storage
            .normalized
            .query(chain_id, range, Some(DecodeStatus::Quarantined))?
            .into_iter()
            .map(|r| r.key)
            .collect();

        let mut report = ReplayReport::default();
        let mut changed = Vec::new();
        for key in keys {
            let Some(stored) = self.storage.raw.get(&key)? else {
                debug!("No raw record for quarantined {}", key);
                continue;
            };
            if stored.retracted {
                continue;
            }
            report.examined += 1;

            let current = self.storage.normalized.get(&key)?;
            for record in self.decoder.decode(&stored.record) {
                if record.is_quarantined() {
                    report.still_quarantined += 1;
                } else {
                    report.resolved += 1;
                }
                let unchanged = current
                    .iter()
                    .any(|s| !s.retracted && s.record == record);
                if !unchanged {
                    changed.push(record);
                }
            }
        }

        report.written = commit.commit_normalized(&changed)?;
        core_metrics::increment("decode_quarantine_replayed_total", report.resolved as u64);
        info!(
            "Quarantine replay on chain {} {}: {} examined, {} resolved, {} still quarantined, {} written",
            chain_id,
            range,
            report.examined,
            report.resolved,
            report.still_quarantined,
            report.written
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::commit::CommitConfig;
    use crate::pipeline::decoder::tests::{transfer_payload, transfer_schema};
    use crate::pipeline::reorg::ReconciliationLocks;
    use crate::schema::InMemorySchemaRegistry;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Instant;
    use strata_core::{BlockHash, RawRecord, SourceKey};

    fn raw(block: u64, seq: u64) -> RawRecord {
        RawRecord {
            source_id: "api".into(),
            chain_id: 1,
            block_number: block,
            block_hash: BlockHash::from_low_u64(block),
            parent_hash: None,
            sequence_index: seq,
            payload: transfer_payload(1_000 + seq),
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn test_replay_resolves_after_registration() {
        let storage = Storage::in_memory();
        let registry = Arc::new(InMemorySchemaRegistry::new());
        let decoder = Decoder::new(registry.clone());
        let source = SourceKey::new("api", 1);
        let locks = ReconciliationLocks::default();
        let mut commit = CommitPipeline::new(
            source.clone(),
            storage.clone(),
            CommitConfig::default(),
            locks.lock_for(&source),
        )
        .unwrap();

        let now = Instant::now();
        for seq in 0..3 {
            let r = raw(100, seq);
            let normalized = decoder.decode(&r);
            assert!(normalized[0].is_quarantined());
            commit.push(r, normalized, now);
        }
        commit.flush().unwrap();

        let replayer = QuarantineReplayer::new(storage.clone(), decoder.clone());

        // nothing registered yet: nothing changes
        let report = replayer.replay(1, BlockRange::from(0), &mut commit).unwrap();
        assert_eq!(report.examined, 3);
        assert_eq!(report.still_quarantined, 3);
        assert_eq!(report.written, 0);

        registry.register(transfer_schema(1)).unwrap();
        let report = replayer.replay(1, BlockRange::from(0), &mut commit).unwrap();
        assert_eq!(report.resolved, 3);
        assert_eq!(report.written, 3);

        let ok = storage
            .normalized
            .query(1, BlockRange::single(100), Some(DecodeStatus::Ok))
            .unwrap();
        assert_eq!(ok.len(), 3);
        assert_eq!(ok[0], decoder.decode(&raw(100, 0))[0]);
        assert!(
            storage
                .normalized
                .query(1, BlockRange::single(100), Some(DecodeStatus::Quarantined))
                .unwrap()
                .is_empty()
        );

        // a second pass finds nothing left to do
        let report = replayer.replay(1, BlockRange::from(0), &mut commit).unwrap();
        assert_eq!(report, ReplayReport::default());
    }

    #[test]
    fn test_replay_skips_retracted_raw() {
        let storage = Storage::in_memory();
        let registry = Arc::new(InMemorySchemaRegistry::new());
        let decoder = Decoder::new(registry.clone());
        let source = SourceKey::new("api", 1);
        let mut commit = CommitPipeline::new(
            source.clone(),
            storage.clone(),
            CommitConfig::default(),
            ReconciliationLocks::default().lock_for(&source),
        )
        .unwrap();

        let r = raw(100, 0);
        commit.push(r.clone(), decoder.decode(&r), Instant::now());
        commit.flush().unwrap();
        storage.raw.mark_retracted(&r.identity_key()).unwrap();

        registry.register(transfer_schema(1)).unwrap();
        let replayer = QuarantineReplayer::new(storage.clone(), decoder);
        let report = replayer.replay(1, BlockRange::from(0), &mut commit).unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(report.written, 0);
    }
}
