//! Storage wrappers for exercising failure paths in tests.

use super::{BatchId, BatchPublisher, CasOutcome, CheckpointStore, Storage};
use crate::Result;
use std::sync::Arc;
use strata_core::{Checkpoint, SourceKey};

/// Which checkpoint writes [`ConflictingCheckpoints`] refuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Refuse {
    /// Every compare-and-set and every publish.
    All,
    /// Only batch publishes; plain compare-and-set goes through.
    Publish,
}

/// Reports a conflict for every refused checkpoint write on `victim`,
/// as if another writer always got there first. Other sources pass
/// through to `inner`.
pub(crate) struct ConflictingCheckpoints {
    inner: Storage,
    victim: SourceKey,
    refuse: Refuse,
}

impl ConflictingCheckpoints {
    /// `inner` with checkpoint writes for `victim` refused per `refuse`.
    pub(crate) fn wrap(inner: Storage, victim: SourceKey, refuse: Refuse) -> Storage {
        let wrapper = Arc::new(Self {
            inner: inner.clone(),
            victim,
            refuse,
        });
        Storage {
            checkpoints: wrapper.clone(),
            publisher: wrapper,
            ..inner
        }
    }

    fn conflict(&self, key: &SourceKey) -> Result<CasOutcome> {
        Ok(CasOutcome::Conflict(self.inner.checkpoints.get(key)?))
    }
}

impl CheckpointStore for ConflictingCheckpoints {
    fn get(&self, key: &SourceKey) -> Result<Option<Checkpoint>> {
        self.inner.checkpoints.get(key)
    }

    fn compare_and_set(
        &self,
        key: &SourceKey,
        expected: Option<&Checkpoint>,
        new: Checkpoint,
    ) -> Result<CasOutcome> {
        if *key == self.victim && self.refuse == Refuse::All {
            return self.conflict(key);
        }
        self.inner.checkpoints.compare_and_set(key, expected, new)
    }

    fn list(&self) -> Result<Vec<Checkpoint>> {
        self.inner.checkpoints.list()
    }
}

impl BatchPublisher for ConflictingCheckpoints {
    fn publish(
        &self,
        batch: BatchId,
        source: &SourceKey,
        expected: Option<&Checkpoint>,
        next: Checkpoint,
    ) -> Result<CasOutcome> {
        if *source == self.victim {
            return self.conflict(source);
        }
        self.inner.publisher.publish(batch, source, expected, next)
    }
}
