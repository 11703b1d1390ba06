//! Runs one worker per configured source.
//!
//! Workers share storage and the reconciliation lock registry but nothing
//! else. A worker that halts is reported and left stopped; the others keep
//! running.

use crate::pipeline::{Decoder, ReconciliationLocks};
use crate::source::Source;
use crate::store::Storage;
use crate::worker::{Worker, WorkerConfig, WorkerOutcome, WorkerReport};
use std::collections::HashMap;
use strata_core::SourceKey;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct Supervisor {
    storage: Storage,
    decoder: Decoder,
    config: WorkerConfig,
    locks: ReconciliationLocks,
}

impl Supervisor {
    pub fn new(storage: Storage, decoder: Decoder, config: WorkerConfig) -> Self {
        Self {
            storage,
            decoder,
            config,
            locks: ReconciliationLocks::default(),
        }
    }

    pub fn locks(&self) -> &ReconciliationLocks {
        &self.locks
    }

    /// Run every source until each completes, halts, or `cancel` fires.
    /// Returns one report per source, in input order.
    pub async fn run(&self, sources: Vec<Source>, cancel: CancellationToken) -> Vec<WorkerReport> {
        let order: Vec<SourceKey> = sources.iter().map(|s| s.key().clone()).collect();
        info!("Starting {} workers", order.len());

        let mut workers = JoinSet::new();
        for source in sources {
            let lock = self.locks.lock_for(source.key());
            let worker = Worker::new(
                source,
                self.storage.clone(),
                self.decoder.clone(),
                self.config.clone(),
                lock,
            );
            workers.spawn(worker.run(cancel.child_token()));
        }

        let mut reports: HashMap<SourceKey, WorkerReport> = HashMap::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => {
                    info!("{}: worker finished ({})", report.source, report.outcome);
                    reports.insert(report.source.clone(), report);
                }
                Err(e) => error!("Worker task failed: {}", e),
            }
        }

        order
            .into_iter()
            .map(|source| {
                reports.remove(&source).unwrap_or_else(|| {
                    let checkpoint = self.storage.checkpoints.get(&source).ok().flatten();
                    WorkerReport {
                        source,
                        checkpoint,
                        outcome: WorkerOutcome::Halted("worker task panicked".into()),
                    }
                })
            })
            .collect()
    }
}
