//! Live websocket source.
//!
//! Opens an alloy pubsub provider and subscribes to new heads and logs,
//! forwarding each notification as a raw record. Before going live it
//! catches up from the requested block over HTTP; backfills use the same
//! endpoint.
//!
//! Logs flagged `removed` are skipped. Reorgs are detected from header
//! parent linkage by the sequence tracker, not from the provider's flag.

use super::rpc::{ChainClient, header_record, log_filter, log_record};
use super::{RecordSink, RecordStream};
use crate::error::unavailable;
use crate::Result;
use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Header, Log};
use alloy::transports::ws::WsConnect;
use futures::StreamExt;
use futures::stream::select;
use std::time::Duration;
use strata_core::{BlockRange, SourceKey};
use tracing::{debug, info, warn};

/// Configuration for the websocket source.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// `ws://` or `wss://` URL.
    pub endpoint: String,

    /// JSON-RPC HTTP endpoint for catch-up and backfill. Defaults to the
    /// websocket URL with its scheme swapped to `http`/`https`.
    pub rpc_endpoint: Option<String>,

    pub start_block: u64,

    /// Restrict logs to these contract addresses (empty means all).
    pub addresses: Vec<Address>,

    /// Blocks per `eth_getLogs` call during catch-up and backfill.
    pub batch_blocks: u64,

    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            rpc_endpoint: None,
            start_block: 0,
            addresses: Vec::new(),
            batch_blocks: 100,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl WebSocketConfig {
    /// The HTTP endpoint used for catch-up and backfill.
    pub fn http_endpoint(&self) -> String {
        if let Some(rpc) = &self.rpc_endpoint {
            return rpc.clone();
        }
        if let Some(rest) = self.endpoint.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = self.endpoint.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else {
            self.endpoint.clone()
        }
    }
}

/// One notification from either subscription.
enum Notification {
    Head(Header),
    Log(Log),
}

/// Live head and log subscription feed.
#[derive(Debug, Clone)]
pub struct WebSocketSource {
    key: SourceKey,
    config: WebSocketConfig,
}

impl WebSocketSource {
    pub fn new(key: SourceKey, config: WebSocketConfig) -> Self {
        Self { key, config }
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    fn client(&self) -> Result<ChainClient> {
        ChainClient::new(self.config.http_endpoint(), self.config.request_timeout)
    }

    pub fn subscribe(&self, from: u64) -> RecordStream {
        let client = match self.client() {
            Ok(c) => c,
            Err(e) => return RecordStream::failed(e),
        };
        let key = self.key.clone();
        let config = self.config.clone();
        RecordStream::spawn(move |sink| async move {
            catch_up(&client, &key, &config, from, &sink).await?;
            listen(&key, &config, &sink).await
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

async fn catch_up(
    client: &ChainClient,
    key: &SourceKey,
    config: &WebSocketConfig,
    from: u64,
    sink: &RecordSink,
) -> Result<()> {
    let head = client.block_number().await?;
    if from > head {
        return Ok(());
    }
    info!("{}: catching up {}..={} before going live", key, from, head);
    client
        .fetch_chunked(
            key,
            BlockRange::new(from, head)?,
            config.batch_blocks,
            &config.addresses,
            sink,
        )
        .await?;
    Ok(())
}

async fn listen(key: &SourceKey, config: &WebSocketConfig, sink: &RecordSink) -> Result<()> {
    let provider = ProviderBuilder::new()
        .on_ws(WsConnect::new(config.endpoint.as_str()))
        .await?;
    info!("{}: connected to {}", key, config.endpoint);

    let heads = provider.subscribe_blocks().await?.into_stream();
    let logs = provider
        .subscribe_logs(&log_filter(&config.addresses))
        .await?
        .into_stream();
    let mut notifications = select(
        heads.map(Notification::Head),
        logs.map(Notification::Log),
    );

    while let Some(notification) = notifications.next().await {
        let record = match notification {
            Notification::Head(header) => header_record(key, &header),
            Notification::Log(log) if log.removed => {
                debug!("{}: skipping removed log at {:?}", key, log.block_number);
                continue;
            }
            Notification::Log(log) => log_record(key, &log, None),
        };
        match record {
            Ok(record) => sink.send(record).await?,
            Err(e) => warn!("{}: malformed notification: {}", key, e),
        }
    }

    Err(unavailable(&key.source_id, "websocket subscription ended"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_endpoint_derivation() {
        let mut config = WebSocketConfig {
            endpoint: "wss://eth.example.org/v2/key".into(),
            ..Default::default()
        };
        assert_eq!(config.http_endpoint(), "https://eth.example.org/v2/key");

        config.endpoint = "ws://localhost:8546".into();
        assert_eq!(config.http_endpoint(), "http://localhost:8546");

        config.rpc_endpoint = Some("http://localhost:8545".into());
        assert_eq!(config.http_endpoint(), "http://localhost:8545");
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let source = WebSocketSource::new(
            SourceKey::new("ws", 1),
            WebSocketConfig {
                endpoint: "ws://127.0.0.1:1".into(),
                request_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );
        let mut stream = source.subscribe(0);
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_transient());
    }
}
