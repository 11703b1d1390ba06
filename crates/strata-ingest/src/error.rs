//! Error types for the ingestion engine.

use strata_core::IdentityKey;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Data model error.
    #[error("Model error: {0}")]
    Core(#[from] strata_core::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Chain RPC transport error (HTTP or websocket).
    #[error("RPC error: {0}")]
    Rpc(#[from] alloy::transports::TransportError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Schema definition error.
    #[error("Schema error: {0}")]
    Schema(String),

    /// The source could not be reached or returned an error.
    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable {
        /// Source that failed.
        source_id: String,
        /// What went wrong.
        reason: String,
    },

    /// A source call exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Two records share an identity key but carry different payloads.
    #[error("integrity fault at {key}: {detail}")]
    IntegrityFault {
        /// The colliding identity key.
        key: IdentityKey,
        /// Description of the mismatch.
        detail: String,
    },

    /// Checkpoint compare-and-set kept failing.
    #[error("checkpoint conflict for {key} after {attempts} attempts")]
    CheckpointConflict {
        /// `source@chain` of the checkpoint.
        key: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Batch journal error.
    #[error("Batch error: {0}")]
    Batch(String),

    /// Channel send error.
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Channel receive error.
    #[error("Channel receive error")]
    ChannelRecv,
}

impl Error {
    /// Whether this fault must halt the worker that hit it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::IntegrityFault { .. }
                | Error::CheckpointConflict { .. }
                | Error::RocksDb(_)
                | Error::Batch(_)
        )
    }

    /// Whether this is a source-side failure worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::SourceUnavailable { .. }
                | Error::Timeout(_)
                | Error::Http(_)
                | Error::Rpc(_)
        )
    }
}

/// A [`Error::SourceUnavailable`] for `source_id`.
pub(crate) fn unavailable(source_id: &str, reason: impl Into<String>) -> Error {
    Error::SourceUnavailable {
        source_id: source_id.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strata_core::BlockHash;

    #[test]
    fn test_integrity_fault_display() {
        let key = IdentityKey {
            chain_id: 1,
            block_hash: BlockHash::from_low_u64(5),
            sequence_index: 0,
        };
        let err = Error::IntegrityFault {
            key,
            detail: "payload fingerprint mismatch".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("integrity fault at 1:0x"));
        assert!(msg.contains("fingerprint mismatch"));
        assert!(err.is_fatal());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_classification() {
        let conflict = Error::CheckpointConflict {
            key: "ws@1".into(),
            attempts: 5,
        };
        assert_eq!(
            conflict.to_string(),
            "checkpoint conflict for ws@1 after 5 attempts"
        );
        assert!(conflict.is_fatal());

        let unavailable = unavailable("ws", "connection reset");
        assert_eq!(
            unavailable.to_string(),
            "source ws unavailable: connection reset"
        );
        assert!(unavailable.is_transient());
        assert!(!unavailable.is_fatal());

        assert!(Error::Timeout(Duration::from_secs(3)).is_transient());
        assert!(!Error::Config("x".into()).is_fatal());
        assert!(!Error::ChannelRecv.is_transient());
    }

    #[test]
    fn test_from_core_error() {
        let core = strata_core::Error::InvalidRange { start: 2, end: 1 };
        let err: Error = core.into();
        assert!(matches!(err, Error::Core(_)));
        assert!(err.to_string().contains("2..=1"));
    }
}
