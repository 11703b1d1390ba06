//! Windowed deduplication by identity key.
//!
//! The [`Deduplicator`] remembers the identity keys it has passed within the
//! last `window`, capped at `max_entries`. A repeat inside the window is
//! dropped. Anything older falls through to the raw store, which enforces
//! identity-key uniqueness at commit time, so the window only has to cover
//! the longest redelivery delay of any source.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use strata_core::{ChainId, IdentityKey, RawRecord};
use tracing::{debug, warn};

/// Deduplicator tuning.
#[derive(Debug, Clone)]
pub struct DedupeConfig {
    pub window: Duration,
    pub max_entries: usize,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(600),
            max_entries: 1_000_000,
        }
    }
}

/// Outcome of [`Deduplicator::check_and_mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// First sighting within the window; now marked.
    New,
    /// Same key and payload seen within the window; drop it.
    Duplicate,
    /// Same key, different payload. Forwarded so the commit path can hold
    /// the batch and raise an integrity fault.
    Conflict,
}

/// Counters kept by the deduplicator.
#[derive(Debug, Clone, Default)]
pub struct DedupeStats {
    pub checked: u64,
    pub duplicates: u64,
    pub conflicts: u64,
    pub evicted: u64,
}

struct Seen {
    block_number: u64,
    fingerprint: [u8; 32],
    generation: u64,
}

/// Bounded, time-windowed set of recently seen identity keys.
pub struct Deduplicator {
    config: DedupeConfig,
    seen: HashMap<IdentityKey, Seen>,
    order: VecDeque<(Instant, u64, IdentityKey)>,
    generation: u64,
    stats: DedupeStats,
}

impl Deduplicator {
    pub fn new(config: DedupeConfig) -> Self {
        Self {
            config,
            seen: HashMap::new(),
            order: VecDeque::new(),
            generation: 0,
            stats: DedupeStats::default(),
        }
    }

    /// Check a record and mark it seen if new.
    pub fn check_and_mark(&mut self, record: &RawRecord, now: Instant) -> Verdict {
        self.expire(now);
        self.stats.checked += 1;

        let key = record.identity_key();
        let fingerprint = record.fingerprint();

        if let Some(seen) = self.seen.get(&key) {
            if seen.fingerprint == fingerprint {
                self.stats.duplicates += 1;
                debug!("Duplicate record {} from {}", key, record.source_id);
                return Verdict::Duplicate;
            }
            self.stats.conflicts += 1;
            warn!(
                "Identity key {} redelivered with a different payload by {}",
                key, record.source_id
            );
            return Verdict::Conflict;
        }

        self.generation += 1;
        self.seen.insert(
            key,
            Seen {
                block_number: record.block_number,
                fingerprint,
                generation: self.generation,
            },
        );
        self.order.push_back((now, self.generation, key));

        while self.seen.len() > self.config.max_entries {
            if !self.pop_oldest() {
                break;
            }
            self.stats.evicted += 1;
        }

        Verdict::New
    }

    /// Forget every key on `chain_id` at or above `block_number`, so a
    /// reorged range can be ingested again.
    pub fn forget_from(&mut self, chain_id: ChainId, block_number: u64) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|key, seen| key.chain_id != chain_id || seen.block_number < block_number);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn stats(&self) -> &DedupeStats {
        &self.stats
    }

    fn expire(&mut self, now: Instant) {
        while let Some((seen_at, _, _)) = self.order.front() {
            if now.duration_since(*seen_at) < self.config.window {
                break;
            }
            self.pop_oldest();
        }
    }

    /// Drop the oldest queue entry; the map entry goes only if it is still
    /// the same sighting (it may have been forgotten and re-marked since).
    fn pop_oldest(&mut self) -> bool {
        let Some((_, generation, key)) = self.order.pop_front() else {
            return false;
        };
        if self
            .seen
            .get(&key)
            .is_some_and(|seen| seen.generation == generation)
        {
            self.seen.remove(&key);
        }
        true
    }
}
