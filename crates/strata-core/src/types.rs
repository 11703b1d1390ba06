//! Raw record model shared by every pipeline stage.
//!
//! A [`RawRecord`] is the bronze-tier unit of data: one chain event (or one
//! block header) exactly as a source delivered it. Its identity is the
//! [`IdentityKey`] `(chain_id, block_hash, sequence_index)`, which is what the
//! deduplicator checks, what the raw store enforces uniqueness on, and what a
//! reorg retracts.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Numeric chain identifier (EIP-155 style).
pub type ChainId = u64;

/// Sequence index reserved for block-header records.
///
/// Sources emit one header record per block so the sequence tracker observes
/// every height, including blocks without any matching events.
pub const HEADER_SEQUENCE: u64 = u64::MAX;

/// A 32-byte block hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// The all-zero hash.
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    /// Parse a hash from hex, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| Error::HexDecode(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(Error::InvalidField {
                field: "block_hash",
                reason: format!("expected 32 bytes, got {}", bytes.len()),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Build a hash whose last eight bytes hold `n` (big-endian).
    ///
    /// Handy for fixtures and synthetic chains.
    pub fn from_low_u64(n: u64) -> Self {
        let mut arr = [0u8; 32];
        arr[24..].copy_from_slice(&n.to_be_bytes());
        Self(arr)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `0x`-prefixed lowercase hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl FromStr for BlockHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde helpers for `0x`-prefixed hex byte strings.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as a `0x`-prefixed hex string.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    /// Deserialize a hex string (prefix optional) into bytes.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(s).map_err(serde::de::Error::custom)
    }

    /// Same as the parent module, for `Option<Vec<u8>>` fields.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize optional bytes as a hex string or `null`.
        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => super::serialize(b, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional hex string.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            let s: Option<String> = Option::deserialize(deserializer)?;
            match s {
                Some(s) => {
                    let s = s.strip_prefix("0x").unwrap_or(&s);
                    hex::decode(s).map(Some).map_err(serde::de::Error::custom)
                }
                None => Ok(None),
            }
        }
    }
}

/// Unique identity of a chain record: `(chain_id, block_hash, sequence_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub chain_id: ChainId,
    pub block_hash: BlockHash,
    pub sequence_index: u64,
}

impl IdentityKey {
    /// Whether this key addresses a block-header record.
    pub fn is_header(&self) -> bool {
        self.sequence_index == HEADER_SEQUENCE
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_header() {
            write!(f, "{}:{}:header", self.chain_id, self.block_hash)
        } else {
            write!(
                f,
                "{}:{}:{}",
                self.chain_id, self.block_hash, self.sequence_index
            )
        }
    }
}

/// A `(block_number, block_hash)` position on a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPointer {
    pub number: u64,
    pub hash: BlockHash,
}

impl BlockPointer {
    pub fn new(number: u64, hash: BlockHash) -> Self {
        Self { number, hash }
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

/// Inclusive range of block numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    /// Create a range, rejecting `start > end`.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// A range covering a single block.
    pub fn single(block: u64) -> Self {
        Self {
            start: block,
            end: block,
        }
    }

    /// Every block from `start` onwards.
    pub fn from(start: u64) -> Self {
        Self {
            start,
            end: u64::MAX,
        }
    }

    pub fn contains(&self, block: u64) -> bool {
        block >= self.start && block <= self.end
    }

    /// Number of blocks in the range.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    /// Always false: ranges hold at least one block.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &BlockRange) -> BlockRange {
        BlockRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.end == u64::MAX {
            write!(f, "{}..", self.start)
        } else {
            write!(f, "{}..={}", self.start, self.end)
        }
    }
}

/// Identifies one ingestion stream: a source on a chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub source_id: String,
    pub chain_id: ChainId,
}

impl SourceKey {
    pub fn new(source_id: impl Into<String>, chain_id: ChainId) -> Self {
        Self {
            source_id: source_id.into(),
            chain_id,
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.source_id, self.chain_id)
    }
}

/// A raw chain record as delivered by a source. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Source that produced the record.
    pub source_id: String,

    pub chain_id: ChainId,

    pub block_number: u64,

    pub block_hash: BlockHash,

    /// Hash of the parent block, when the source knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_hash: Option<BlockHash>,

    /// Position within the block (log index, tx index, or [`HEADER_SEQUENCE`]).
    pub sequence_index: u64,

    /// Opaque payload bytes; interpreted by the decoder.
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,

    /// When the source received the record.
    pub ingested_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            chain_id: self.chain_id,
            block_hash: self.block_hash,
            sequence_index: self.sequence_index,
        }
    }

    pub fn pointer(&self) -> BlockPointer {
        BlockPointer::new(self.block_number, self.block_hash)
    }

    pub fn is_header(&self) -> bool {
        self.sequence_index == HEADER_SEQUENCE
    }

    /// SHA-256 of the payload.
    ///
    /// Two records with the same identity key must carry the same payload;
    /// the fingerprint is what gets compared.
    pub fn fingerprint(&self) -> [u8; 32] {
        Sha256::digest(&self.payload).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> RawRecord {
        RawRecord {
            source_id: "ws-main".to_string(),
            chain_id: 1,
            block_number: 100,
            block_hash: BlockHash::from_low_u64(100),
            parent_hash: Some(BlockHash::from_low_u64(99)),
            sequence_index: 3,
            payload: vec![0xde, 0xad, 0xbe, 0xef],
            ingested_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_block_hash_hex_parsing() {
        let hex = "0x00000000000000000000000000000000000000000000000000000000000000ff";
        let hash = BlockHash::from_hex(hex).unwrap();
        assert_eq!(hash.to_hex(), hex);
        assert_eq!(hash, BlockHash::from_low_u64(255));

        // Prefix is optional
        let bare = BlockHash::from_hex(&hex[2..]).unwrap();
        assert_eq!(bare, hash);
    }

    #[test]
    fn test_block_hash_rejects_wrong_length() {
        let err = BlockHash::from_hex("0xabcd").unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "block_hash", .. }));

        let err = BlockHash::from_hex("0xzz").unwrap_err();
        assert!(matches!(err, Error::HexDecode(_)));
    }

    #[test]
    fn test_record_serde_uses_hex() {
        let record = sample_record();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["payload"], "0xdeadbeef");
        assert_eq!(json["block_hash"], BlockHash::from_low_u64(100).to_hex());

        let back: RawRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_identity_key_ignores_provenance() {
        let a = sample_record();
        let mut b = sample_record();
        b.source_id = "historical".to_string();
        b.ingested_at = Utc::now();
        assert_eq!(a.identity_key(), b.identity_key());
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.payload.push(0);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_header_identity_display() {
        let mut record = sample_record();
        record.sequence_index = HEADER_SEQUENCE;
        assert!(record.is_header());
        assert!(record.identity_key().to_string().ends_with(":header"));
    }

    #[test]
    fn test_block_range() {
        assert!(BlockRange::new(5, 4).is_err());
        let range = BlockRange::new(100, 103).unwrap();
        assert_eq!(range.len(), 4);
        assert!(range.contains(100));
        assert!(range.contains(103));
        assert!(!range.contains(104));
        assert_eq!(range.to_string(), "100..=103");
        assert_eq!(BlockRange::from(7).to_string(), "7..");
        assert_eq!(
            range.union(&BlockRange::single(110)),
            BlockRange::new(100, 110).unwrap()
        );
    }
}
