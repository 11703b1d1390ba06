//! Engine configuration.
//!
//! Loaded from a TOML file, then overridden from the environment:
//!
//! - `STRATA_DATA_DIR`: RocksDB directory
//! - `STRATA_METRICS_PORT`: Prometheus port (0 disables the server)
//! - `STRATA_SCHEMA_PATH`: JSON schema file for the registry
//!
//! ```toml
//! dedup_window_seconds = 600
//! commit_batch_size = 500
//! commit_batch_timeout_ms = 2000
//! reorg_confirmation_depth = 64
//! data_dir = "./data/strata"
//!
//! [[sources]]
//! type = "websocket"
//! id = "mainnet-ws"
//! chain_id = 1
//! endpoint = "wss://eth.example.org"
//! start_block = 19000000
//!
//! [[sources]]
//! type = "historical"
//! id = "mainnet-archive"
//! chain_id = 1
//! endpoint = "https://archive.example.org"
//! start_block = 18000000
//! end_block = 18999999
//!
//! [tuning]
//! source_timeout_ms = 30000
//! ```

use crate::pipeline::{CommitConfig, DedupeConfig, TrackerConfig};
use crate::source::rpc::parse_addresses;
use crate::source::{
    ApiConfig, ApiSource, HistoricalConfig, HistoricalSource, JsonlConfig, JsonlSource, Source,
    SourceKind, WebSocketConfig, WebSocketSource,
};
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_core::{ChainId, SourceKey};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub sources: Vec<SourceConfig>,

    /// How long an identity key is remembered by the deduplicator.
    #[serde(default = "default_dedup_window_seconds")]
    pub dedup_window_seconds: u64,

    /// Records per commit batch.
    #[serde(default = "default_commit_batch_size")]
    pub commit_batch_size: usize,

    /// Maximum age of an open batch before it is flushed.
    #[serde(default = "default_commit_batch_timeout_ms")]
    pub commit_batch_timeout_ms: u64,

    /// Recent blocks remembered per source for reorg detection.
    #[serde(default = "default_reorg_confirmation_depth")]
    pub reorg_confirmation_depth: u64,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Prometheus metrics port (0 to disable).
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Event schema file loaded into the registry at startup.
    #[serde(default)]
    pub schema_path: Option<PathBuf>,

    #[serde(default)]
    pub tuning: TuningConfig,
}

/// Knobs most deployments leave alone.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TuningConfig {
    /// Deadline for the next record from a source before it is torn down.
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,

    /// How long a gap may persist before its range is backfilled.
    #[serde(default = "default_gap_timeout_ms")]
    pub gap_timeout_ms: u64,

    /// Out-of-order records buffered ahead of the tracked position.
    #[serde(default = "default_max_buffered_records")]
    pub max_buffered_records: usize,

    #[serde(default = "default_dedup_max_entries")]
    pub dedup_max_entries: usize,

    /// Records queued between a worker's ingress and processing tasks.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Checkpoint compare-and-set attempts before the worker halts.
    #[serde(default = "default_cas_retry_budget")]
    pub cas_retry_budget: u32,
}

/// One `[[sources]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub kind: SourceKindConfig,

    pub id: String,

    pub chain_id: ChainId,

    /// URL for network sources. Unused by `jsonl`.
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub start_block: u64,

    /// Finite sources stop after this block.
    #[serde(default)]
    pub end_block: Option<u64>,

    /// `websocket`: JSON-RPC HTTP endpoint for catch-up and backfill.
    #[serde(default)]
    pub rpc_endpoint: Option<String>,

    /// `websocket`/`historical`: blocks per `eth_getLogs` call.
    #[serde(default = "default_batch_blocks")]
    pub batch_blocks: u64,

    /// `historical`/`api`: wait between polls once caught up.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    /// `websocket`/`historical`: contract addresses to filter logs by.
    #[serde(default)]
    pub addresses: Vec<String>,

    /// `jsonl`: input file or directory.
    #[serde(default)]
    pub input: Option<PathBuf>,

    /// `api`: blocks requested per page.
    #[serde(default = "default_batch_blocks")]
    pub page_blocks: u64,
}

/// `type` values accepted in `[[sources]]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKindConfig {
    Websocket,
    Historical,
    Api,
    Jsonl,
}

impl From<SourceKindConfig> for SourceKind {
    fn from(kind: SourceKindConfig) -> Self {
        match kind {
            SourceKindConfig::Websocket => SourceKind::WebSocket,
            SourceKindConfig::Historical => SourceKind::Historical,
            SourceKindConfig::Api => SourceKind::Api,
            SourceKindConfig::Jsonl => SourceKind::Jsonl,
        }
    }
}

fn default_dedup_window_seconds() -> u64 {
    600
}

fn default_commit_batch_size() -> usize {
    500
}

fn default_commit_batch_timeout_ms() -> u64 {
    2000
}

fn default_reorg_confirmation_depth() -> u64 {
    64
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/strata")
}

fn default_metrics_port() -> u16 {
    9091
}

fn default_source_timeout_ms() -> u64 {
    30_000
}

fn default_gap_timeout_ms() -> u64 {
    10_000
}

fn default_max_buffered_records() -> usize {
    10_000
}

fn default_dedup_max_entries() -> usize {
    1_000_000
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_cas_retry_budget() -> u32 {
    5
}

fn default_batch_blocks() -> u64 {
    100
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            source_timeout_ms: default_source_timeout_ms(),
            gap_timeout_ms: default_gap_timeout_ms(),
            max_buffered_records: default_max_buffered_records(),
            dedup_max_entries: default_dedup_max_entries(),
            queue_capacity: default_queue_capacity(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            cas_retry_budget: default_cas_retry_budget(),
        }
    }
}

impl Config {
    /// Load, apply environment overrides, and validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::parse(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML string. No environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config = Self::parse(toml)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(toml: &str) -> Result<Self> {
        toml::from_str(toml).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))
    }

    /// Apply `STRATA_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("STRATA_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(port) = std::env::var("STRATA_METRICS_PORT") {
            self.metrics_port = port
                .parse()
                .map_err(|_| Error::Config(format!("STRATA_METRICS_PORT is not a port: {}", port)))?;
        }
        if let Ok(path) = std::env::var("STRATA_SCHEMA_PATH") {
            self.schema_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::Config("at least one source is required".into()));
        }
        if self.commit_batch_size == 0 {
            return Err(Error::Config("commit_batch_size must be > 0".into()));
        }
        if self.commit_batch_timeout_ms == 0 {
            return Err(Error::Config("commit_batch_timeout_ms must be > 0".into()));
        }
        if self.dedup_window_seconds == 0 {
            return Err(Error::Config("dedup_window_seconds must be > 0".into()));
        }
        if self.reorg_confirmation_depth == 0 {
            return Err(Error::Config("reorg_confirmation_depth must be > 0".into()));
        }

        let tuning = &self.tuning;
        if tuning.source_timeout_ms == 0 || tuning.gap_timeout_ms == 0 {
            return Err(Error::Config(
                "tuning source_timeout_ms and gap_timeout_ms must be > 0".into(),
            ));
        }
        if tuning.queue_capacity == 0 || tuning.dedup_max_entries == 0 {
            return Err(Error::Config(
                "tuning queue_capacity and dedup_max_entries must be > 0".into(),
            ));
        }
        if tuning.cas_retry_budget == 0 {
            return Err(Error::Config("tuning cas_retry_budget must be > 0".into()));
        }
        if tuning.backoff_initial_ms == 0 || tuning.backoff_initial_ms > tuning.backoff_max_ms {
            return Err(Error::Config(format!(
                "tuning backoff_initial_ms ({}) must be > 0 and <= backoff_max_ms ({})",
                tuning.backoff_initial_ms, tuning.backoff_max_ms
            )));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert((source.id.as_str(), source.chain_id)) {
                return Err(Error::Config(format!(
                    "duplicate source {}@{}",
                    source.id, source.chain_id
                )));
            }
        }
        Ok(())
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            confirmation_depth: self.reorg_confirmation_depth,
            max_buffered: self.tuning.max_buffered_records,
            gap_timeout: Duration::from_millis(self.tuning.gap_timeout_ms),
        }
    }

    pub fn dedupe_config(&self) -> DedupeConfig {
        DedupeConfig {
            window: Duration::from_secs(self.dedup_window_seconds),
            max_entries: self.tuning.dedup_max_entries,
        }
    }

    pub fn commit_config(&self) -> CommitConfig {
        CommitConfig {
            batch_size: self.commit_batch_size,
            batch_timeout: Duration::from_millis(self.commit_batch_timeout_ms),
            cas_retry_budget: self.tuning.cas_retry_budget,
        }
    }

    /// Build every configured source.
    pub fn build_sources(&self) -> Result<Vec<Source>> {
        let timeout = Duration::from_millis(self.tuning.source_timeout_ms);
        self.sources.iter().map(|s| s.build(timeout)).collect()
    }
}

impl SourceConfig {
    pub fn key(&self) -> SourceKey {
        SourceKey::new(self.id.clone(), self.chain_id)
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("source id cannot be empty".into()));
        }
        let needs_endpoint = self.kind != SourceKindConfig::Jsonl;
        if needs_endpoint && self.endpoint.trim().is_empty() {
            return Err(Error::Config(format!("source {}: endpoint is required", self.id)));
        }
        match self.kind {
            SourceKindConfig::Websocket
                if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) =>
            {
                return Err(Error::Config(format!(
                    "source {}: websocket endpoint must start with ws:// or wss://",
                    self.id
                )));
            }
            SourceKindConfig::Jsonl if self.input.is_none() => {
                return Err(Error::Config(format!("source {}: input is required", self.id)));
            }
            _ => {}
        }
        if self.batch_blocks == 0 || self.page_blocks == 0 {
            return Err(Error::Config(format!(
                "source {}: batch_blocks and page_blocks must be > 0",
                self.id
            )));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(Error::Config(format!(
                "source {}: poll_interval_ms must be > 0",
                self.id
            )));
        }
        if let Some(end) = self.end_block
            && end < self.start_block
        {
            return Err(Error::Config(format!(
                "source {}: end_block {} is before start_block {}",
                self.id, end, self.start_block
            )));
        }
        Ok(())
    }

    /// Build the source. `request_timeout` bounds each HTTP call.
    pub fn build(&self, request_timeout: Duration) -> Result<Source> {
        let key = self.key();
        let poll = self.poll_interval_ms.map(Duration::from_millis);
        let addresses = parse_addresses(&self.addresses)?;
        let source = match self.kind {
            SourceKindConfig::Websocket => Source::WebSocket(WebSocketSource::new(
                key,
                WebSocketConfig {
                    endpoint: self.endpoint.clone(),
                    rpc_endpoint: self.rpc_endpoint.clone(),
                    start_block: self.start_block,
                    addresses,
                    batch_blocks: self.batch_blocks,
                    request_timeout,
                },
            )),
            SourceKindConfig::Historical => {
                let defaults = HistoricalConfig::default();
                Source::Historical(HistoricalSource::new(
                    key,
                    HistoricalConfig {
                        endpoint: self.endpoint.clone(),
                        start_block: self.start_block,
                        end_block: self.end_block,
                        batch_blocks: self.batch_blocks,
                        poll_interval: poll.unwrap_or(defaults.poll_interval),
                        addresses,
                        request_timeout,
                    },
                ))
            }
            SourceKindConfig::Api => {
                let defaults = ApiConfig::default();
                Source::Api(ApiSource::new(
                    key,
                    ApiConfig {
                        endpoint: self.endpoint.clone(),
                        start_block: self.start_block,
                        end_block: self.end_block,
                        page_blocks: self.page_blocks,
                        poll_interval: poll.unwrap_or(defaults.poll_interval),
                        request_timeout,
                    },
                ))
            }
            SourceKindConfig::Jsonl => {
                let input = self.input.clone().ok_or_else(|| {
                    Error::Config(format!("source {}: input is required", self.id))
                })?;
                Source::Jsonl(JsonlSource::new(
                    key,
                    JsonlConfig {
                        input,
                        start_block: self.start_block,
                        ..Default::default()
                    },
                ))
            }
        };
        Ok(source)
    }
}
