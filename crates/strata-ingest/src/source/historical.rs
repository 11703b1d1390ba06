//! Historical block source over JSON-RPC.
//!
//! Walks the chain in chunks of `batch_blocks` through an alloy HTTP
//! provider: one `eth_getLogs` call per chunk plus one
//! `eth_getBlockByNumber` per block. With `end_block` set the
//! stream ends once that block is delivered; without it the source keeps
//! following the head, polling every `poll_interval`.

use super::rpc::ChainClient;
use super::{RecordSink, RecordStream};
use crate::Result;
use alloy::primitives::Address;
use std::time::Duration;
use strata_core::{BlockRange, SourceKey};
use tracing::{debug, info};

/// Configuration for the historical source.
#[derive(Debug, Clone)]
pub struct HistoricalConfig {
    /// JSON-RPC HTTP endpoint.
    pub endpoint: String,

    pub start_block: u64,

    /// Last block to deliver. `None` follows the chain head indefinitely.
    pub end_block: Option<u64>,

    /// Blocks per `eth_getLogs` call.
    pub batch_blocks: u64,

    /// Wait between head checks once caught up.
    pub poll_interval: Duration,

    /// Restrict logs to these contract addresses (empty means all).
    pub addresses: Vec<Address>,

    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl Default for HistoricalConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            start_block: 0,
            end_block: None,
            batch_blocks: 100,
            poll_interval: Duration::from_secs(5),
            addresses: Vec::new(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Ranged fetch from a JSON-RPC node.
#[derive(Debug, Clone)]
pub struct HistoricalSource {
    key: SourceKey,
    config: HistoricalConfig,
}

impl HistoricalSource {
    pub fn new(key: SourceKey, config: HistoricalConfig) -> Self {
        Self { key, config }
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn config(&self) -> &HistoricalConfig {
        &self.config
    }

    fn client(&self) -> Result<ChainClient> {
        ChainClient::new(self.config.endpoint.clone(), self.config.request_timeout)
    }

    pub fn subscribe(&self, from: u64) -> RecordStream {
        let client = match self.client() {
            Ok(c) => c,
            Err(e) => return RecordStream::failed(e),
        };
        let key = self.key.clone();
        let config = self.config.clone();
        RecordStream::spawn(move |sink| async move {
            follow(client, key, config, from, sink).await
        })
    }

    pub fn backfill(&self, range: BlockRange) -> RecordStream {
        let client = match self.client() {
            Ok(c) => c,
            Err(e) => return RecordStream::failed(e),
        };
        let key = self.key.clone();
        let config = self.config.clone();
        RecordStream::spawn(move |sink| async move {
            client
                .fetch_chunked(&key, range, config.batch_blocks, &config.addresses, &sink)
                .await?;
            Ok(())
        })
    }
}

async fn follow(
    client: ChainClient,
    key: SourceKey,
    config: HistoricalConfig,
    from: u64,
    sink: RecordSink,
) -> Result<()> {
    let mut cursor = from;
    info!("{}: historical fetch from block {} via {}", key, from, client.endpoint());

    loop {
        if config.end_block.is_some_and(|end| cursor > end) {
            info!("{}: reached end block, historical fetch complete", key);
            return Ok(());
        }

        let head = client.block_number().await?;
        let upper = config.end_block.map_or(head, |end| end.min(head));
        if cursor > upper {
            debug!("{}: caught up at {}, waiting for head", key, head);
            tokio::time::sleep(config.poll_interval).await;
            continue;
        }

        let range = BlockRange::new(cursor, upper)?;
        match client
            .fetch_chunked(&key, range, config.batch_blocks, &config.addresses, &sink)
            .await?
        {
            Some(last) => cursor = last + 1,
            None => tokio::time::sleep(config.poll_interval).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_surfaces_transient_error() {
        let source = HistoricalSource::new(
            SourceKey::new("hist", 1),
            HistoricalConfig {
                endpoint: "http://127.0.0.1:1".into(),
                request_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );
        let mut stream = source.subscribe(0);
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_transient());
    }
}
