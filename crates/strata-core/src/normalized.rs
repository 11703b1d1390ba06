//! Normalized (silver-tier) records.
//!
//! A [`NormalizedRecord`] is derived from exactly one [`RawRecord`] by the
//! decoder. It carries the raw record's identity key, plus an `ordinal` for
//! payloads that fan out into several records (a receipt with many logs).
//!
//! [`RawRecord`]: crate::RawRecord

use crate::types::{IdentityKey, hex_bytes};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of decoding a raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeStatus {
    Ok,
    Quarantined,
}

impl DecodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeStatus::Ok => "ok",
            DecodeStatus::Quarantined => "quarantined",
        }
    }
}

impl fmt::Display for DecodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, decoded field value.
///
/// Integers are kept as decimal strings so 256-bit values survive
/// serialization without loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DecodedValue {
    /// `0x`-prefixed, lowercase, 20-byte address.
    Address(String),
    Uint(String),
    Int(String),
    Bool(bool),
    /// `bytesN`, hex encoded.
    FixedBytes(String),
    /// Dynamic `bytes`, hex encoded.
    Bytes(String),
    String(String),
}

/// A decoded record in the normalized store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Identity key of the raw record this was decoded from.
    pub key: IdentityKey,

    /// Position among the records decoded from the same raw record.
    pub ordinal: u32,

    pub block_number: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,

    /// Schema version used; `None` when no schema matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,

    #[serde(default)]
    pub decoded_fields: BTreeMap<String, DecodedValue>,

    pub decode_status: DecodeStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_reason: Option<String>,

    /// Original payload, kept for quarantined records so they can be replayed.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "hex_bytes::option"
    )]
    pub payload: Option<Vec<u8>>,
}

impl NormalizedRecord {
    /// Build a quarantined record that preserves the raw payload.
    pub fn quarantined(
        key: IdentityKey,
        ordinal: u32,
        block_number: u64,
        payload: Vec<u8>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            key,
            ordinal,
            block_number,
            contract_address: None,
            event_name: None,
            schema_version: None,
            decoded_fields: BTreeMap::new(),
            decode_status: DecodeStatus::Quarantined,
            quarantine_reason: Some(reason.into()),
            payload: Some(payload),
        }
    }

    pub fn is_quarantined(&self) -> bool {
        self.decode_status == DecodeStatus::Quarantined
    }
}
