//! Error types for the Strata data model.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or parsing model values.
#[derive(Error, Debug)]
pub enum Error {
    /// A field has an invalid format (e.g., wrong hex length).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// Hex decoding error.
    #[error("hex decode error: {0}")]
    HexDecode(String),

    /// A block range whose start lies after its end.
    #[error("invalid block range: {start}..={end}")]
    InvalidRange {
        /// First block of the range.
        start: u64,
        /// Last block of the range.
        end: u64,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
