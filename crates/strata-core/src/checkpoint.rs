//! Checkpoints and reorg events.

use crate::types::{BlockHash, BlockPointer, BlockRange, ChainId, SourceKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable ingestion progress for one `(source_id, chain_id)`.
///
/// Checkpoints are versioned records: every successful compare-and-set
/// bumps `version` by one, and writers must present the version they read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: String,
    pub chain_id: ChainId,

    /// Highest fully committed block, if any.
    #[serde(default)]
    pub head: Option<BlockPointer>,

    /// Ranges written under a pending batch marker but not yet finalized.
    #[serde(default)]
    pub in_flight: Vec<BlockRange>,

    pub version: u64,

    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// An empty checkpoint (nothing committed yet).
    pub fn empty(key: &SourceKey) -> Self {
        Self {
            source_id: key.source_id.clone(),
            chain_id: key.chain_id,
            head: None,
            in_flight: Vec::new(),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> SourceKey {
        SourceKey::new(self.source_id.clone(), self.chain_id)
    }

    /// Block number of the committed head.
    pub fn block_number(&self) -> Option<u64> {
        self.head.map(|p| p.number)
    }

    /// The first block a resumed source should deliver.
    ///
    /// The head block itself is delivered again: a batch may have ended
    /// part-way through it, and repeats are absorbed by deduplication.
    pub fn resume_from(&self) -> Option<u64> {
        self.head.map(|p| p.number)
    }

    /// Copy with a new head and the given range removed from `in_flight`.
    pub fn advanced(&self, head: Option<BlockPointer>, settled: Option<BlockRange>) -> Self {
        let mut next = self.clone();
        next.head = head;
        if let Some(range) = settled {
            next.in_flight.retain(|r| *r != range);
        }
        next.updated_at = Utc::now();
        next
    }

    /// Copy with `range` added to `in_flight`.
    pub fn with_in_flight(&self, range: BlockRange) -> Self {
        let mut next = self.clone();
        if !next.in_flight.contains(&range) {
            next.in_flight.push(range);
        }
        next.updated_at = Utc::now();
        next
    }
}

/// A change of canonical block at a height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgEvent {
    pub source_id: String,
    pub chain_id: ChainId,
    pub block_number: u64,
    /// Hash previously accepted at `block_number`.
    pub old_hash: BlockHash,
    /// Hash now canonical at `block_number`.
    pub new_hash: BlockHash,
    pub detected_at: DateTime<Utc>,
}

impl ReorgEvent {
    pub fn key(&self) -> SourceKey {
        SourceKey::new(self.source_id.clone(), self.chain_id)
    }

    /// Height the tracker and checkpoint rewind to.
    pub fn rewind_to(&self) -> Option<u64> {
        self.block_number.checked_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_advance_settles_range() {
        let key = SourceKey::new("hist", 1);
        let range = BlockRange::new(100, 103).unwrap();
        let cp = Checkpoint::empty(&key).with_in_flight(range);
        assert_eq!(cp.in_flight, vec![range]);
        assert_eq!(cp.resume_from(), None);

        let head = BlockPointer::new(103, BlockHash::from_low_u64(103));
        let next = cp.advanced(Some(head), Some(range));
        assert!(next.in_flight.is_empty());
        assert_eq!(next.block_number(), Some(103));
        assert_eq!(next.resume_from(), Some(103));
        // version is owned by the store
        assert_eq!(next.version, cp.version);
    }

    #[test]
    fn test_reorg_rewind_target() {
        let event = ReorgEvent {
            source_id: "ws".into(),
            chain_id: 1,
            block_number: 101,
            old_hash: BlockHash::from_low_u64(101),
            new_hash: BlockHash::from_low_u64(1101),
            detected_at: Utc::now(),
        };
        assert_eq!(event.rewind_to(), Some(100));
        assert_eq!(event.key().to_string(), "ws@1");
    }
}
