//! Source adapters.
//!
//! Every source kind implements the same capability: `subscribe(from)`
//! returns a [`RecordStream`] of [`RawRecord`]s starting at a block, and
//! `backfill(range)` returns a finite stream covering a block range. Streams
//! are restartable from any position; redelivery is absorbed downstream by
//! the deduplicator and the raw store.
//!
//! # Available Sources
//!
//! - [`WebSocketSource`] - live `eth_subscribe` feed (infinite)
//! - [`HistoricalSource`] - ranged JSON-RPC fetch (finite with `end_block`)
//! - [`ApiSource`] - off-chain HTTP poll
//! - [`JsonlSource`] - recorded raw records from JSONL files (finite)
//!
//! Each source emits a block-header record (`sequence_index =
//! HEADER_SEQUENCE`) after the event records of every block, so the sequence
//! tracker sees each height and its parent linkage.
//!
//! Dropping a [`RecordStream`] aborts its producer task. That is how a timed
//! out or superseded connection is torn down.

mod api;
mod historical;
mod jsonl;
pub mod rpc;
mod websocket;

pub use api::{ApiConfig, ApiSource};
pub use historical::{HistoricalConfig, HistoricalSource};
pub use jsonl::{JsonlConfig, JsonlSource};
pub use websocket::{WebSocketConfig, WebSocketSource};

use crate::{Error, Result};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use strata_core::{BlockRange, RawRecord, SourceKey};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Records buffered between a producer task and its consumer.
const STREAM_CAPACITY: usize = 1024;

/// Source kind, as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    WebSocket,
    Historical,
    Api,
    Jsonl,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::WebSocket => "websocket",
            SourceKind::Historical => "historical",
            SourceKind::Api => "api",
            SourceKind::Jsonl => "jsonl",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured source. One variant per kind.
#[derive(Debug, Clone)]
pub enum Source {
    WebSocket(WebSocketSource),
    Historical(HistoricalSource),
    Api(ApiSource),
    Jsonl(JsonlSource),
}

impl Source {
    pub fn key(&self) -> &SourceKey {
        match self {
            Source::WebSocket(s) => s.key(),
            Source::Historical(s) => s.key(),
            Source::Api(s) => s.key(),
            Source::Jsonl(s) => s.key(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Source::WebSocket(_) => SourceKind::WebSocket,
            Source::Historical(_) => SourceKind::Historical,
            Source::Api(_) => SourceKind::Api,
            Source::Jsonl(_) => SourceKind::Jsonl,
        }
    }

    /// First block to deliver when there is no checkpoint.
    pub fn start_block(&self) -> u64 {
        match self {
            Source::WebSocket(s) => s.config().start_block,
            Source::Historical(s) => s.config().start_block,
            Source::Api(s) => s.config().start_block,
            Source::Jsonl(s) => s.config().start_block,
        }
    }

    /// How long a caught-up source may stay quiet between polls.
    pub fn poll_interval(&self) -> Option<Duration> {
        match self {
            Source::Historical(s) => Some(s.config().poll_interval),
            Source::Api(s) => Some(s.config().poll_interval),
            Source::WebSocket(_) | Source::Jsonl(_) => None,
        }
    }

    /// Stream records from `from` (or the configured start block).
    pub fn subscribe(&self, from: Option<u64>) -> RecordStream {
        let from = from.unwrap_or_else(|| self.start_block());
        debug!("{}: subscribing from block {}", self.key(), from);
        match self {
            Source::WebSocket(s) => s.subscribe(from),
            Source::Historical(s) => s.subscribe(from),
            Source::Api(s) => s.subscribe(from),
            Source::Jsonl(s) => s.subscribe(from),
        }
    }

    /// Stream every record in `range`, then end.
    pub fn backfill(&self, range: BlockRange) -> RecordStream {
        debug!("{}: backfilling {}", self.key(), range);
        match self {
            Source::WebSocket(s) => s.backfill(range),
            Source::Historical(s) => s.backfill(range),
            Source::Api(s) => s.backfill(range),
            Source::Jsonl(s) => s.backfill(range),
        }
    }
}

/// Producer half of a [`RecordStream`].
#[derive(Clone)]
pub struct RecordSink {
    tx: mpsc::Sender<Result<RawRecord>>,
}

impl RecordSink {
    /// Send a record, waiting while the consumer is behind.
    pub async fn send(&self, record: RawRecord) -> Result<()> {
        self.tx
            .send(Ok(record))
            .await
            .map_err(|_| Error::ChannelSend("record stream closed".into()))
    }

    pub async fn send_all(&self, records: impl IntoIterator<Item = RawRecord>) -> Result<()> {
        for record in records {
            self.send(record).await?;
        }
        Ok(())
    }
}

/// A lazily produced sequence of raw records.
///
/// Yields `Err` once if the producer failed, then ends. A stream that ends
/// without an error is complete.
pub struct RecordStream {
    rx: mpsc::Receiver<Result<RawRecord>>,
    task: Option<JoinHandle<()>>,
}

impl RecordStream {
    /// Run `producer` on its own task, feeding the returned stream.
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(RecordSink) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let fut = producer(RecordSink { tx: tx.clone() });
        let task = tokio::spawn(async move {
            if let Err(e) = fut.await {
                // receiver may already be gone
                let _ = tx.send(Err(e)).await;
            }
        });
        Self {
            rx,
            task: Some(task),
        }
    }

    /// A stream over records already in memory.
    pub fn from_records(records: Vec<RawRecord>) -> Self {
        Self::spawn(|sink| async move { sink.send_all(records).await })
    }

    /// A stream that fails immediately.
    pub fn failed(error: Error) -> Self {
        Self::spawn(|_| async move { Err(error) })
    }

    /// Next record, `None` once the producer has finished.
    pub async fn next(&mut self) -> Option<Result<RawRecord>> {
        self.rx.recv().await
    }

    /// Next record, failing with [`Error::Timeout`] after `deadline`.
    pub async fn next_within(&mut self, deadline: Duration) -> Option<Result<RawRecord>> {
        match tokio::time::timeout(deadline, self.rx.recv()).await {
            Ok(item) => item,
            Err(_) => Some(Err(Error::Timeout(deadline))),
        }
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempts: 0,
        }
    }

    /// Delay before the next attempt; doubles each call up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempts += 1;
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strata_core::BlockHash;

    fn record(block: u64) -> RawRecord {
        RawRecord {
            source_id: "mem".into(),
            chain_id: 1,
            block_number: block,
            block_hash: BlockHash::from_low_u64(block),
            parent_hash: None,
            sequence_index: 0,
            payload: b"{}".to_vec(),
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        assert_eq!(b.attempts(), 4);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_stream_yields_then_ends() {
        let mut stream = RecordStream::from_records(vec![record(1), record(2)]);
        assert_eq!(stream.next().await.unwrap().unwrap().block_number, 1);
        assert_eq!(stream.next().await.unwrap().unwrap().block_number, 2);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_surfaces_producer_error() {
        let mut stream = RecordStream::failed(crate::error::unavailable("ws", "connection refused"));
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_transient());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_deadline() {
        let mut stream = RecordStream::spawn(|_sink| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let err = stream
            .next_within(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_dropping_stream_aborts_producer() {
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let stream = RecordStream::spawn(move |sink| async move {
            let _keep = done_tx;
            while sink.send(record(1)).await.is_ok() {}
            Ok(())
        });
        drop(stream);
        // the producer (and its sender) is gone once aborted
        assert!(done_rx.recv().await.is_none());
    }
}
