//! The per-source processing pipeline.
//!
//! ```text
//! Source → SequenceTracker → Deduplicator → Decoder → CommitPipeline
//!               ↑                                          ↑
//!               └──────────── ReorgReconciler ─────────────┘
//! ```

pub mod commit;
pub mod decoder;
pub mod dedupe;
pub mod reorg;
pub mod replay;
pub mod sequence;

pub use commit::{BatchSummary, CommitConfig, CommitPipeline, CommitStats, RecoveryReport};
pub use decoder::Decoder;
pub use dedupe::{DedupeConfig, DedupeStats, Deduplicator, Verdict};
pub use reorg::{
    ReconcileState, Reconciliation, ReconciliationLocks, ReorgReconciler, SourceLock,
};
pub use replay::{QuarantineReplayer, ReplayReport};
pub use sequence::{Admission, SequenceTracker, TrackerConfig};
