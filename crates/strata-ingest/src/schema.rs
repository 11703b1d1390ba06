//! Versioned event schemas.
//!
//! A schema describes how one event, identified by
//! `(chain_id, contract_address, event_signature)`, is laid out in a log.
//! Schemas change over time; each version carries the block it takes effect
//! at, and [`SchemaRegistry::resolve`] picks the newest version whose
//! `effective_block` is at or below the record's block.
//!
//! # Schema file format
//!
//! ```json
//! [
//!   {
//!     "chain_id": 1,
//!     "address": "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48",
//!     "signature": "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef",
//!     "name": "Transfer",
//!     "version": 1,
//!     "effective_block": 0,
//!     "fields": [
//!       { "name": "from",  "kind": "address", "indexed": true },
//!       { "name": "to",    "kind": "address", "indexed": true },
//!       { "name": "value", "kind": "uint256" }
//!     ]
//!   }
//! ]
//! ```

use crate::{Error, Result};
use alloy::dyn_abi::DynSolType;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use strata_core::ChainId;
use tracing::info;

/// ABI type of a field.
///
/// Parsed with alloy's Solidity type parser. Only value types are accepted:
/// arrays and tuples have no [`DecodedValue`](strata_core::DecodedValue)
/// rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldKind(DynSolType);

impl FieldKind {
    pub fn new(ty: DynSolType) -> std::result::Result<Self, String> {
        match ty {
            DynSolType::Address
            | DynSolType::Bool
            | DynSolType::Uint(_)
            | DynSolType::Int(_)
            | DynSolType::FixedBytes(_)
            | DynSolType::Bytes
            | DynSolType::String => Ok(Self(ty)),
            other => Err(format!(
                "unsupported field kind '{}'",
                other.sol_type_name()
            )),
        }
    }

    pub fn sol_type(&self) -> &DynSolType {
        &self.0
    }
}

impl FromStr for FieldKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let ty = DynSolType::parse(s.trim())
            .map_err(|e| format!("unknown field kind '{}': {}", s, e))?;
        Self::new(ty)
    }
}

impl TryFrom<String> for FieldKind {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.sol_type_name())
    }
}

impl From<FieldKind> for String {
    fn from(kind: FieldKind) -> Self {
        kind.to_string()
    }
}

/// One field of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    /// Indexed fields come from topics, others from `data`.
    #[serde(default)]
    pub indexed: bool,
}

/// A versioned event schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSchema {
    pub chain_id: ChainId,
    /// Contract address, `0x`-prefixed.
    pub address: String,
    /// Event signature hash (topic 0), `0x`-prefixed.
    pub signature: String,
    pub name: String,
    pub version: u32,
    /// First block this version applies to.
    #[serde(default)]
    pub effective_block: u64,
    pub fields: Vec<FieldSpec>,
}

impl EventSchema {
    /// Check internal consistency and normalize hex casing.
    pub fn validate(mut self) -> Result<Self> {
        self.address = normalize_hex(&self.address);
        self.signature = normalize_hex(&self.signature);

        if self.address.len() != 42 {
            return Err(Error::Schema(format!(
                "{} v{}: address must be 20 bytes",
                self.name, self.version
            )));
        }
        if self.signature.len() != 66 {
            return Err(Error::Schema(format!(
                "{} v{}: signature must be a 32-byte topic hash",
                self.name, self.version
            )));
        }
        if self.version == 0 {
            return Err(Error::Schema(format!("{}: version must be >= 1", self.name)));
        }

        let mut names = HashSet::new();
        for field in &self.fields {
            if !names.insert(field.name.as_str()) {
                return Err(Error::Schema(format!(
                    "{} v{}: duplicate field '{}'",
                    self.name, self.version, field.name
                )));
            }
        }
        // topic 0 is the signature, so three indexed fields at most
        if self.indexed_count() > 3 {
            return Err(Error::Schema(format!(
                "{} v{}: more than 3 indexed fields",
                self.name, self.version
            )));
        }
        Ok(self)
    }

    pub fn indexed_count(&self) -> usize {
        self.fields.iter().filter(|f| f.indexed).count()
    }
}

/// Lowercase with a `0x` prefix.
pub fn normalize_hex(s: &str) -> String {
    let s = s.trim();
    let body = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    format!("0x{}", body.to_ascii_lowercase())
}

/// Resolves the schema version in force for an event at a block.
pub trait SchemaRegistry: Send + Sync {
    fn resolve(
        &self,
        chain_id: ChainId,
        contract_address: &str,
        event_signature: &str,
        block_number: u64,
    ) -> Option<Arc<EventSchema>>;
}

type RegistryKey = (ChainId, String, String);

/// Thread-safe in-memory registry. Schemas can be added while workers run.
#[derive(Default)]
pub struct InMemorySchemaRegistry {
    schemas: RwLock<HashMap<RegistryKey, Vec<Arc<EventSchema>>>>,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a JSON schema file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let registry = Self::new();
        registry.load_file(path)?;
        Ok(registry)
    }

    /// Register a schema version. A version with the same effective block
    /// replaces the existing one.
    pub fn register(&self, schema: EventSchema) -> Result<()> {
        let schema = schema.validate()?;
        let key = (
            schema.chain_id,
            schema.address.clone(),
            schema.signature.clone(),
        );
        let mut schemas = self.schemas.write();
        let versions = schemas.entry(key).or_default();
        versions.retain(|s| s.effective_block != schema.effective_block);
        versions.push(Arc::new(schema));
        versions.sort_by_key(|s| s.effective_block);
        Ok(())
    }

    /// Load every schema in a JSON array file. Returns how many were added.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let schemas: Vec<EventSchema> = serde_json::from_slice(&bytes)?;
        let count = schemas.len();
        for schema in schemas {
            self.register(schema)?;
        }
        info!("Loaded {} event schemas from {}", count, path.display());
        Ok(count)
    }

    /// Number of registered schema versions.
    pub fn len(&self) -> usize {
        self.schemas.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SchemaRegistry for InMemorySchemaRegistry {
    fn resolve(
        &self,
        chain_id: ChainId,
        contract_address: &str,
        event_signature: &str,
        block_number: u64,
    ) -> Option<Arc<EventSchema>> {
        let key = (
            chain_id,
            normalize_hex(contract_address),
            normalize_hex(event_signature),
        );
        let schemas = self.schemas.read();
        schemas
            .get(&key)?
            .iter()
            .rev()
            .find(|s| s.effective_block <= block_number)
            .cloned()
    }
}
