//! Chain RPC access through alloy, and conversion of blocks and logs to raw
//! records.
//!
//! Payloads are built from a fixed subset of fields, all lowercase hex, so
//! the same log fetched through `eth_getLogs` and pushed through a `logs`
//! subscription carries a byte-identical payload.

use super::RecordSink;
use crate::error::unavailable;
use crate::{Error, Result};
use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{BlockNumberOrTag, BlockTransactionsKind, Filter, Header, Log};
use alloy::transports::TransportResult;
use alloy::transports::http::{Client, Http};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::time::Duration;
use strata_core::{BlockHash, BlockRange, HEADER_SEQUENCE, RawRecord, SourceKey};
use tracing::debug;

#[derive(Serialize)]
struct LogPayload {
    address: String,
    topics: Vec<String>,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeaderPayload {
    number: u64,
    hash: String,
    parent_hash: String,
    timestamp: u64,
}

/// HTTP provider for one source, with a per-request deadline.
#[derive(Clone)]
pub struct ChainClient {
    provider: RootProvider<Http<Client>>,
    endpoint: String,
    timeout: Duration,
}

impl ChainClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.into();
        let url: reqwest::Url = endpoint
            .parse()
            .map_err(|e| Error::Config(format!("invalid RPC URL {}: {}", endpoint, e)))?;
        let provider = ProviderBuilder::new().on_http(url);
        Ok(Self {
            provider,
            endpoint,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn deadline<T, F>(&self, call: F) -> Result<T>
    where
        F: IntoFuture<Output = TransportResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout(self.timeout)),
        }
    }

    /// Current chain head.
    pub async fn block_number(&self) -> Result<u64> {
        self.deadline(self.provider.get_block_number()).await
    }

    /// Header of block `number`, `None` past the head.
    pub async fn header_by_number(&self, number: u64) -> Result<Option<Header>> {
        let block = self
            .deadline(self.provider.get_block_by_number(
                BlockNumberOrTag::Number(number),
                BlockTransactionsKind::Hashes,
            ))
            .await?;
        Ok(block.map(|b| b.header))
    }

    /// Logs in `range`, optionally restricted to `addresses`.
    pub async fn logs(&self, range: BlockRange, addresses: &[Address]) -> Result<Vec<Log>> {
        let filter = log_filter(addresses)
            .from_block(range.start)
            .to_block(range.end);
        self.deadline(self.provider.get_logs(&filter)).await
    }

    /// Fetch `range` block by block and send each block's logs (by log
    /// index) followed by its header. Stops early at the chain head.
    /// Returns the last block sent.
    pub async fn fetch_range(
        &self,
        source: &SourceKey,
        range: BlockRange,
        addresses: &[Address],
        sink: &RecordSink,
    ) -> Result<Option<u64>> {
        let logs = self.logs(range, addresses).await?;
        let mut by_block: BTreeMap<u64, Vec<Log>> = BTreeMap::new();
        for log in logs {
            if log.removed {
                continue;
            }
            let Some(number) = log.block_number else {
                continue;
            };
            by_block.entry(number).or_default().push(log);
        }

        let mut last = None;
        for number in range.start..=range.end {
            let Some(header) = self.header_by_number(number).await? else {
                debug!("{}: block {} not available yet", source, number);
                break;
            };
            let header = header_record(source, &header)?;
            let mut logs = by_block.remove(&number).unwrap_or_default();
            logs.sort_by_key(|l| l.log_index);
            for log in &logs {
                // a log fetched from another fork than the header gets no parent
                let same_block = log.block_hash.map(to_block_hash) == Some(header.block_hash);
                let parent = if same_block { header.parent_hash } else { None };
                sink.send(log_record(source, log, parent)?).await?;
            }
            sink.send(header).await?;
            last = Some(number);
        }
        Ok(last)
    }

    /// [`fetch_range`](Self::fetch_range) in chunks of `step` blocks.
    pub async fn fetch_chunked(
        &self,
        source: &SourceKey,
        range: BlockRange,
        step: u64,
        addresses: &[Address],
        sink: &RecordSink,
    ) -> Result<Option<u64>> {
        let step = step.max(1);
        let mut start = range.start;
        let mut last = None;
        while start <= range.end {
            let end = start.saturating_add(step - 1).min(range.end);
            let chunk = BlockRange::new(start, end)?;
            match self.fetch_range(source, chunk, addresses, sink).await? {
                Some(block) => last = Some(block),
                None => break,
            }
            if last != Some(end) {
                // stopped short at the head
                break;
            }
            start = end + 1;
        }
        Ok(last)
    }
}

/// A log filter over `addresses`; empty means every contract.
pub fn log_filter(addresses: &[Address]) -> Filter {
    let filter = Filter::new();
    if addresses.is_empty() {
        filter
    } else {
        filter.address(addresses.to_vec())
    }
}

/// Parse configured contract addresses.
pub fn parse_addresses(addresses: &[String]) -> Result<Vec<Address>> {
    addresses
        .iter()
        .map(|a| {
            a.trim()
                .parse::<Address>()
                .map_err(|e| Error::Config(format!("invalid contract address {}: {}", a, e)))
        })
        .collect()
}

fn to_block_hash(hash: B256) -> BlockHash {
    BlockHash(hash.0)
}

fn hex_string(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Raw record for a log. `parent` is the parent hash of the log's block,
/// when known.
pub fn log_record(source: &SourceKey, log: &Log, parent: Option<BlockHash>) -> Result<RawRecord> {
    let number = log
        .block_number
        .ok_or_else(|| unavailable(&source.source_id, "log without blockNumber"))?;
    let hash = log
        .block_hash
        .ok_or_else(|| unavailable(&source.source_id, "log without blockHash"))?;
    let index = log
        .log_index
        .ok_or_else(|| unavailable(&source.source_id, "log without logIndex"))?;

    let payload = serde_json::to_vec(&LogPayload {
        address: hex_string(log.inner.address.as_slice()),
        topics: log
            .inner
            .data
            .topics()
            .iter()
            .map(|t| hex_string(t.as_slice()))
            .collect(),
        data: hex_string(&log.inner.data.data),
    })?;

    Ok(RawRecord {
        source_id: source.source_id.clone(),
        chain_id: source.chain_id,
        block_number: number,
        block_hash: to_block_hash(hash),
        parent_hash: parent,
        sequence_index: index,
        payload,
        ingested_at: Utc::now(),
    })
}

/// Header record for a block; always carries the parent hash.
pub fn header_record(source: &SourceKey, header: &Header) -> Result<RawRecord> {
    header_fields_record(
        source,
        header.number,
        header.hash,
        header.parent_hash,
        header.timestamp,
    )
}

fn header_fields_record(
    source: &SourceKey,
    number: u64,
    hash: B256,
    parent_hash: B256,
    timestamp: u64,
) -> Result<RawRecord> {
    let payload = serde_json::to_vec(&HeaderPayload {
        number,
        hash: hex_string(hash.as_slice()),
        parent_hash: hex_string(parent_hash.as_slice()),
        timestamp,
    })?;

    Ok(RawRecord {
        source_id: source.source_id.clone(),
        chain_id: source.chain_id,
        block_number: number,
        block_hash: to_block_hash(hash),
        parent_hash: Some(to_block_hash(parent_hash)),
        sequence_index: HEADER_SEQUENCE,
        payload,
        ingested_at: Utc::now(),
    })
}
