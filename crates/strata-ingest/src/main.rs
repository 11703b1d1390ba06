//! Strata ingestion daemon.
//!
//! Runs one ingestion worker per configured source and commits raw and
//! normalized records into the RocksDB store.
//!
//! # Usage
//!
//! ```bash
//! # Run with a config file
//! strata-ingest --config /etc/strata/strata.toml
//!
//! # Override paths from the command line
//! strata-ingest --config strata.toml \
//!     --data-dir /data/strata \
//!     --schema-path /etc/strata/schemas.json \
//!     --metrics-port 9091
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT (Ctrl+C) or SIGTERM:
//! 1. Every worker stops pulling from its source
//! 2. Records already queued are processed
//! 3. Open batches are finalized and checkpoints advanced
//! 4. The process exits once every worker has reported

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::metrics::{init_metrics, start_metrics_server};
use strata_ingest::{
    Config, Decoder, InMemorySchemaRegistry, Storage, Supervisor, WorkerConfig, WorkerOutcome,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Strata ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "strata-ingest")]
#[command(about = "Reorg-aware chain data ingestion daemon")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(long, short, default_value = "strata.toml")]
    config: PathBuf,

    /// RocksDB directory (overrides config and STRATA_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Event schema file (overrides config and STRATA_SCHEMA_PATH)
    #[arg(long)]
    schema_path: Option<PathBuf>,

    /// Metrics HTTP server port, 0 to disable (overrides config)
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("strata_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(path) = args.schema_path {
        config.schema_path = Some(path);
    }
    if let Some(port) = args.metrics_port {
        config.metrics_port = port;
    }

    tracing::info!("Strata ingestion daemon starting...");
    tracing::info!("Configuration:");
    tracing::info!("  Data dir: {}", config.data_dir.display());
    tracing::info!(
        "  Schemas: {}",
        config
            .schema_path
            .as_ref()
            .map_or("none".to_string(), |p| p.display().to_string())
    );
    tracing::info!("  Sources: {}", config.sources.len());
    tracing::info!(
        "  Batches: {} records / {}ms",
        config.commit_batch_size,
        config.commit_batch_timeout_ms
    );
    tracing::info!("  Dedup window: {}s", config.dedup_window_seconds);
    tracing::info!("  Reorg depth: {}", config.reorg_confirmation_depth);

    if config.metrics_port > 0 {
        let handle = init_metrics().context("Failed to install metrics recorder")?;
        start_metrics_server(config.metrics_port, handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let registry = match &config.schema_path {
        Some(path) => InMemorySchemaRegistry::from_file(path)
            .with_context(|| format!("Failed to load schemas from {}", path.display()))?,
        None => {
            tracing::warn!("No schema file configured; every event will be quarantined");
            InMemorySchemaRegistry::new()
        }
    };
    tracing::info!("Loaded {} schemas", registry.len());

    let storage = Storage::open_rocks(&config.data_dir)
        .with_context(|| format!("Failed to open store at {}", config.data_dir.display()))?;
    let sources = config.build_sources().context("Failed to build sources")?;

    let cancel = CancellationToken::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        handler_cancel.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let supervisor = Supervisor::new(
        storage,
        Decoder::new(Arc::new(registry)),
        WorkerConfig::from_config(&config),
    );
    let reports = supervisor.run(sources, cancel).await;

    tracing::info!("Final state:");
    let mut halted = 0usize;
    for report in &reports {
        let head = report.checkpoint.as_ref().and_then(|c| c.head);
        match &report.outcome {
            WorkerOutcome::Halted(fault) => {
                halted += 1;
                tracing::error!(
                    "  {}: HALTED at {:?}: {}",
                    report.source,
                    head.map(|h| h.number),
                    fault
                );
            }
            outcome => tracing::info!(
                "  {}: {} at {:?}",
                report.source,
                outcome,
                head.map(|h| h.number)
            ),
        }
    }

    if halted > 0 {
        anyhow::bail!("{} of {} workers halted", halted, reports.len());
    }
    Ok(())
}
