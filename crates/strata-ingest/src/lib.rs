//! Strata ingestion and normalization engine.
//!
//! This crate takes raw chain data from live subscriptions, historical
//! backfills and off-chain APIs, and commits it exactly once into a raw
//! (bronze) store and a validated normalized (silver) store, surviving
//! redelivery, disorder and chain reorganizations.
//!
//! # Modules
//!
//! - [`source`] - Source adapters (websocket, historical JSON-RPC, API, JSONL)
//! - [`pipeline`] - Sequence tracker, deduplicator, decoder, commit pipeline, reorg reconciler
//! - [`schema`] - Versioned event schemas and the registry the decoder resolves against
//! - [`store`] - Raw, normalized, checkpoint and journal stores (in-memory and RocksDB)
//! - [`worker`] / [`supervisor`] - The per-source runtime
//! - [`config`] - TOML configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │     Sources     │  (websocket, historical RPC, API poll, JSONL)
//! └────────┬────────┘
//!          │  bounded queue per source
//!          ▼
//! ┌─────────────────┐
//! │ SequenceTracker │  gaps, backfill requests, reorg detection
//! └────────┬────────┘        │
//!          ▼                 ▼
//! ┌─────────────────┐  ┌─────────────────┐
//! │  Deduplicator   │  │ ReorgReconciler │  retract, rewind, replay
//! └────────┬────────┘  └────────┬────────┘
//!          ▼                    │
//! ┌─────────────────┐           │
//! │     Decoder     │  schemas by effective block, quarantine
//! └────────┬────────┘           │
//!          ▼                    ▼
//! ┌─────────────────────────────────────┐
//! │           CommitPipeline            │  write-ahead batches + checkpoint CAS
//! └─────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod schema;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod worker;

// Re-export commonly used types at crate root
pub use config::{Config, SourceConfig, TuningConfig};
pub use error::{Error, Result};

pub use pipeline::{
    CommitConfig, CommitPipeline, DedupeConfig, Decoder, Deduplicator, QuarantineReplayer,
    ReconcileState, ReconciliationLocks, ReorgReconciler, ReplayReport, SequenceTracker,
    TrackerConfig,
};
pub use schema::{EventSchema, FieldKind, FieldSpec, InMemorySchemaRegistry, SchemaRegistry};
pub use source::{RecordStream, Source, SourceKind};
pub use store::Storage;
pub use supervisor::Supervisor;
pub use worker::{Processor, Worker, WorkerConfig, WorkerOutcome, WorkerReport};
