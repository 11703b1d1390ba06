//! Shared data model for the Strata ingestion engine.
//!
//! This crate provides:
//! - Raw (bronze) records and their identity keys
//! - Normalized (silver) records and decoded values
//! - Checkpoints and reorg events
//! - Prometheus metrics helpers
//! - Shared error types

mod checkpoint;
mod error;
pub mod metrics;
mod normalized;
mod types;

pub use checkpoint::{Checkpoint, ReorgEvent};
pub use error::{Error, Result};
pub use normalized::{DecodeStatus, DecodedValue, NormalizedRecord};
pub use types::{
    BlockHash, BlockPointer, BlockRange, ChainId, HEADER_SEQUENCE, IdentityKey, RawRecord,
    SourceKey, hex_bytes,
};
