//! Off-chain API source.
//!
//! Polls an HTTP endpoint for pages of blocks:
//!
//! ```text
//! GET {endpoint}?from_block=100&to_block=199
//!
//! {
//!   "head": 150,
//!   "blocks": [
//!     {
//!       "number": 100,
//!       "hash": "0x..",
//!       "parent_hash": "0x..",
//!       "records": [{"sequence_index": 0, "payload": {...}}]
//!     }
//!   ]
//! }
//! ```
//!
//! Every block up to `head` is listed, including blocks without records, so
//! a header record can be emitted for each height.

use super::{RecordSink, RecordStream};
use crate::error::unavailable;
use crate::Result;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use strata_core::{BlockHash, BlockRange, HEADER_SEQUENCE, RawRecord, SourceKey};
use tracing::{debug, info};

/// Configuration for the API source.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL; `from_block`/`to_block` are appended as query parameters.
    pub endpoint: String,

    pub start_block: u64,

    /// Last block to deliver. `None` keeps polling.
    pub end_block: Option<u64>,

    /// Blocks requested per page.
    pub page_blocks: u64,

    /// Wait between polls once caught up.
    pub poll_interval: Duration,

    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            start_block: 0,
            end_block: None,
            page_blocks: 100,
            poll_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page {
    head: u64,
    #[serde(default)]
    blocks: Vec<ApiBlock>,
}

#[derive(Debug, Deserialize)]
struct ApiBlock {
    number: u64,
    hash: BlockHash,
    parent_hash: BlockHash,
    #[serde(default)]
    records: Vec<ApiRecord>,
}

#[derive(Debug, Deserialize)]
struct ApiRecord {
    sequence_index: u64,
    payload: Value,
}

/// HTTP poller over an off-chain data API.
#[derive(Debug, Clone)]
pub struct ApiSource {
    key: SourceKey,
    config: ApiConfig,
}

impl ApiSource {
    pub fn new(key: SourceKey, config: ApiConfig) -> Self {
        Self { key, config }
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn poller(&self) -> Result<Poller> {
        let http = reqwest::Client::builder()
            .timeout(self.config.request_timeout)
            .build()?;
        Ok(Poller {
            http,
            key: self.key.clone(),
            config: self.config.clone(),
        })
    }

    pub fn subscribe(&self, from: u64) -> RecordStream {
        let poller = match self.poller() {
            Ok(p) => p,
            Err(e) => return RecordStream::failed(e),
        };
        RecordStream::spawn(move |sink| async move { poller.follow(from, sink).await })
    }

    pub fn backfill(&self, range: BlockRange) -> RecordStream {
        let poller = match self.poller() {
            Ok(p) => p,
            Err(e) => return RecordStream::failed(e),
        };
        RecordStream::spawn(move |sink| async move {
            let mut cursor = range.start;
            while cursor <= range.end {
                let to = cursor
                    .saturating_add(poller.config.page_blocks.max(1) - 1)
                    .min(range.end);
                let page = poller.fetch(cursor, to).await?;
                match poller.emit(page, cursor, to, &sink).await? {
                    Some(last) => cursor = last + 1,
                    None => break,
                }
            }
            Ok(())
        })
    }
}

struct Poller {
    http: reqwest::Client,
    key: SourceKey,
    config: ApiConfig,
}

impl Poller {
    async fn follow(&self, from: u64, sink: RecordSink) -> Result<()> {
        info!("{}: polling {} from block {}", self.key, self.config.endpoint, from);
        let mut cursor = from;
        loop {
            if self.config.end_block.is_some_and(|end| cursor > end) {
                info!("{}: reached end block, API poll complete", self.key);
                return Ok(());
            }
            let mut to = cursor.saturating_add(self.config.page_blocks.max(1) - 1);
            if let Some(end) = self.config.end_block {
                to = to.min(end);
            }

            let page = self.fetch(cursor, to).await?;
            match self.emit(page, cursor, to, &sink).await? {
                Some(last) => cursor = last + 1,
                None => {
                    debug!("{}: nothing new past {}, sleeping", self.key, cursor);
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn fetch(&self, from: u64, to: u64) -> Result<Page> {
        let response = self
            .http
            .get(&self.config.endpoint)
            .query(&[("from_block", from), ("to_block", to)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(
                &self.key.source_id,
                format!("API returned HTTP {}", status),
            ));
        }
        Ok(response.json().await?)
    }

    /// Send the page's blocks within `from..=to` in block order, each
    /// block's records followed by its header. Returns the last block sent.
    async fn emit(&self, page: Page, from: u64, to: u64, sink: &RecordSink) -> Result<Option<u64>> {
        let upper = to.min(page.head);
        let mut blocks = page.blocks;
        blocks.retain(|b| b.number >= from && b.number <= upper);
        blocks.sort_by_key(|b| b.number);

        let mut last = None;
        for block in blocks {
            let mut records = block.records;
            records.sort_by_key(|r| r.sequence_index);
            for record in records {
                let payload = serde_json::to_vec(&record.payload)?;
                sink.send(self.record(&block.hash, block.parent_hash, block.number, record.sequence_index, payload))
                    .await?;
            }
            let header = serde_json::to_vec(&serde_json::json!({
                "number": block.number,
                "hash": block.hash,
                "parentHash": block.parent_hash,
            }))?;
            sink.send(self.record(&block.hash, block.parent_hash, block.number, HEADER_SEQUENCE, header))
                .await?;
            last = Some(block.number);
        }
        Ok(last)
    }

    fn record(
        &self,
        hash: &BlockHash,
        parent: BlockHash,
        number: u64,
        sequence_index: u64,
        payload: Vec<u8>,
    ) -> RawRecord {
        RawRecord {
            source_id: self.key.source_id.clone(),
            chain_id: self.key.chain_id,
            block_number: number,
            block_hash: *hash,
            parent_hash: Some(parent),
            sequence_index,
            payload,
            ingested_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poller() -> Poller {
        Poller {
            http: reqwest::Client::new(),
            key: SourceKey::new("api", 1),
            config: ApiConfig::default(),
        }
    }

    fn page() -> Page {
        serde_json::from_value(serde_json::json!({
            "head": 101,
            "blocks": [
                {
                    "number": 101,
                    "hash": BlockHash::from_low_u64(101),
                    "parent_hash": BlockHash::from_low_u64(100),
                    "records": []
                },
                {
                    "number": 100,
                    "hash": BlockHash::from_low_u64(100),
                    "parent_hash": BlockHash::from_low_u64(99),
                    "records": [
                        {"sequence_index": 2, "payload": {"b": 1, "a": 2}},
                        {"sequence_index": 1, "payload": {"topics": []}}
                    ]
                }
            ]
        }))
        .unwrap()
    }

    async fn emit_all(page: Page, from: u64, to: u64) -> (Option<u64>, Vec<RawRecord>) {
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let sink = RecordSink { tx };
        let last = poller().emit(page, from, to, &sink).await.unwrap();
        drop(sink);
        let mut out = Vec::new();
        while let Some(r) = rx.recv().await {
            out.push(r.unwrap());
        }
        (last, out)
    }

    #[tokio::test]
    async fn test_emit_orders_blocks_and_adds_headers() {
        let (last, records) = emit_all(page(), 100, 199).await;
        assert_eq!(last, Some(101));

        let seen: Vec<(u64, u64)> = records
            .iter()
            .map(|r| (r.block_number, r.sequence_index))
            .collect();
        assert_eq!(
            seen,
            vec![(100, 1), (100, 2), (100, HEADER_SEQUENCE), (101, HEADER_SEQUENCE)]
        );
        assert!(records.iter().all(|r| r.parent_hash.is_some()));
        // payload JSON is re-serialized with sorted keys
        assert_eq!(records[1].payload, br#"{"a":2,"b":1}"#.to_vec());
    }

    #[tokio::test]
    async fn test_emit_ignores_blocks_outside_range() {
        let (last, records) = emit_all(page(), 101, 150).await;
        assert_eq!(last, Some(101));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].block_number, 101);

        let (last, records) = emit_all(page(), 102, 150).await;
        assert_eq!(last, None);
        assert!(records.is_empty());
    }
}
