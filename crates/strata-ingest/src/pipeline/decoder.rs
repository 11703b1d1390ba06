//! Decoder: raw payloads to normalized records.
//!
//! Payloads are JSON envelopes:
//!
//! - a log: `{"address": "0x..", "topics": ["0x..", ..], "data": "0x.."}`
//! - a receipt: `{"logs": [<log>, ..]}`, one normalized record per log
//! - anything else without `topics` or `logs` (block headers): no records
//!
//! Every log is matched against the [`SchemaRegistry`] on
//! `(chain_id, address, topics[0])` at the record's block. A log with no
//! schema, or whose topics and data do not fit the schema, becomes a
//! quarantined record that carries the raw payload. Nothing is dropped.
//!
//! Field values are decoded with alloy's dynamic ABI decoder; indexed
//! dynamic values (`string`, `bytes`) come back as their topic hash.
//!
//! Decoding reads only the record and the registry, so re-running it under
//! the same schema version yields an identical result.

use crate::schema::{EventSchema, SchemaRegistry, normalize_hex};
use alloy::dyn_abi::{DynSolEvent, DynSolType, DynSolValue};
use alloy::primitives::{B256, Bytes};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_core::{DecodeStatus, DecodedValue, NormalizedRecord, RawRecord};

#[derive(Debug, Deserialize)]
struct LogEnvelope {
    address: String,
    topics: Vec<String>,
    #[serde(default)]
    data: Option<String>,
}

/// Maps raw records to normalized records using a schema registry.
#[derive(Clone)]
pub struct Decoder {
    registry: Arc<dyn SchemaRegistry>,
}

impl Decoder {
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Decode one raw record into zero or more normalized records.
    pub fn decode(&self, raw: &RawRecord) -> Vec<NormalizedRecord> {
        let envelope: Value = match serde_json::from_slice(&raw.payload) {
            Ok(v) => v,
            Err(e) => return vec![quarantine(raw, 0, None, format!("payload is not JSON: {}", e))],
        };

        let Value::Object(map) = &envelope else {
            return vec![quarantine(raw, 0, None, "payload is not a JSON object")];
        };

        if let Some(logs) = map.get("logs") {
            let Value::Array(logs) = logs else {
                return vec![quarantine(raw, 0, None, "receipt 'logs' is not an array")];
            };
            return logs
                .iter()
                .enumerate()
                .map(|(i, log)| self.decode_log(raw, i as u32, log))
                .collect();
        }

        if map.contains_key("topics") {
            return vec![self.decode_log(raw, 0, &envelope)];
        }

        // block header or other non-event payload
        Vec::new()
    }

    fn decode_log(&self, raw: &RawRecord, ordinal: u32, value: &Value) -> NormalizedRecord {
        let log = match LogEnvelope::deserialize(value) {
            Ok(log) => log,
            Err(e) => return quarantine(raw, ordinal, None, format!("malformed log: {}", e)),
        };
        let address = normalize_hex(&log.address);

        let parsed = log.topics.iter().map(|t| t.parse::<B256>());
        let topics = match parsed.collect::<Result<Vec<_>, _>>() {
            Ok(topics) => topics,
            Err(_) => {
                return quarantine(raw, ordinal, Some(address), "topic is not a 32-byte hex word");
            }
        };
        let Some(signature) = topics.first() else {
            return quarantine(raw, ordinal, Some(address), "anonymous log has no signature topic");
        };
        let signature = hex_string(signature.as_slice());

        let data = match log.data.as_deref().map(str::parse::<Bytes>) {
            None => Bytes::new(),
            Some(Ok(bytes)) => bytes,
            Some(Err(_)) => return quarantine(raw, ordinal, Some(address), "data is not hex"),
        };

        let Some(schema) =
            self.registry
                .resolve(raw.chain_id, &address, &signature, raw.block_number)
        else {
            return quarantine(
                raw,
                ordinal,
                Some(address),
                format!("no schema for {} at block {}", signature, raw.block_number),
            );
        };

        match decode_fields(&schema, &topics, &data) {
            Ok(decoded_fields) => NormalizedRecord {
                key: raw.identity_key(),
                ordinal,
                block_number: raw.block_number,
                contract_address: Some(address),
                event_name: Some(schema.name.clone()),
                schema_version: Some(schema.version),
                decoded_fields,
                decode_status: DecodeStatus::Ok,
                quarantine_reason: None,
                payload: None,
            },
            Err(reason) => {
                let mut record = quarantine(
                    raw,
                    ordinal,
                    Some(address),
                    format!("{} v{}: {}", schema.name, schema.version, reason),
                );
                record.event_name = Some(schema.name.clone());
                record.schema_version = Some(schema.version);
                record
            }
        }
    }
}

fn quarantine(
    raw: &RawRecord,
    ordinal: u32,
    address: Option<String>,
    reason: impl Into<String>,
) -> NormalizedRecord {
    let mut record = NormalizedRecord::quarantined(
        raw.identity_key(),
        ordinal,
        raw.block_number,
        raw.payload.clone(),
        reason,
    );
    record.contract_address = address;
    record
}

fn hex_string(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode `topics` (signature first) and `data` against `schema`.
fn decode_fields(
    schema: &EventSchema,
    topics: &[B256],
    data: &[u8],
) -> Result<BTreeMap<String, DecodedValue>, String> {
    let indexed = schema.indexed_count();
    if topics.len() != indexed + 1 {
        return Err(format!(
            "expected {} indexed topics, got {}",
            indexed,
            topics.len() - 1
        ));
    }

    let (indexed_fields, body_fields): (Vec<_>, Vec<_>) =
        schema.fields.iter().partition(|f| f.indexed);
    let event = DynSolEvent::new_unchecked(
        topics.first().copied(),
        indexed_fields.iter().map(|f| f.kind.sol_type().clone()).collect(),
        DynSolType::Tuple(body_fields.iter().map(|f| f.kind.sol_type().clone()).collect()),
    );
    let decoded = event
        .decode_log_parts(topics.iter().copied(), data, true)
        .map_err(|e| format!("abi decoding failed: {}", e))?;

    let mut fields = BTreeMap::new();
    let named = indexed_fields
        .iter()
        .zip(decoded.indexed)
        .chain(body_fields.iter().zip(decoded.body));
    for (field, value) in named {
        let value = render(value).map_err(|e| format!("field '{}': {}", field.name, e))?;
        fields.insert(field.name.clone(), value);
    }
    Ok(fields)
}

fn render(value: DynSolValue) -> Result<DecodedValue, String> {
    Ok(match value {
        DynSolValue::Address(address) => DecodedValue::Address(hex_string(address.as_slice())),
        DynSolValue::Bool(b) => DecodedValue::Bool(b),
        DynSolValue::Uint(n, _) => DecodedValue::Uint(n.to_string()),
        DynSolValue::Int(n, _) => DecodedValue::Int(n.to_string()),
        DynSolValue::FixedBytes(word, size) => DecodedValue::FixedBytes(hex_string(&word[..size])),
        DynSolValue::Bytes(bytes) => DecodedValue::Bytes(hex_string(&bytes)),
        DynSolValue::String(s) => DecodedValue::String(s),
        other => {
            return Err(format!(
                "no rendering for {}",
                other.sol_type_name().unwrap_or_default()
            ));
        }
    })
}
