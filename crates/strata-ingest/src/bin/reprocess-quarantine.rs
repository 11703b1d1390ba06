//! Re-decode quarantined records after a schema update.
//!
//! Reads the raw record behind every quarantined normalized record in a
//! block range, decodes it against the current schema file, and commits the
//! records whose output changed. Raw records are never touched.
//!
//! Stop the ingestion daemon before running this against its data dir:
//! RocksDB allows a single writer.
//!
//! # Usage
//!
//! ```bash
//! # Count quarantined records without rewriting anything
//! reprocess-quarantine --data-dir ./data/strata --chain-id 1 --source-id mainnet-ws \
//!     --from 18000000 --check
//!
//! # Re-decode a range against an updated schema file
//! reprocess-quarantine --data-dir ./data/strata --schema ./schemas.json \
//!     --chain-id 1 --source-id mainnet-ws --from 18000000 --to 18100000
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::{BlockRange, DecodeStatus, SourceKey};
use strata_ingest::store::RocksStore;
use strata_ingest::{
    CommitConfig, CommitPipeline, Decoder, InMemorySchemaRegistry, QuarantineReplayer,
    ReconciliationLocks, Storage,
};

#[derive(Parser, Debug)]
#[command(name = "reprocess-quarantine")]
#[command(about = "Re-decode quarantined records against the current schemas")]
struct Args {
    /// Path to the RocksDB data directory
    #[arg(long)]
    data_dir: PathBuf,

    /// Event schema file to decode against
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Chain to reprocess
    #[arg(long)]
    chain_id: u64,

    /// Source whose commit lock and checkpoint the rewrite goes through
    #[arg(long)]
    source_id: String,

    /// First block of the range
    #[arg(long, default_value = "0")]
    from: u64,

    /// Last block of the range (open-ended if omitted)
    #[arg(long)]
    to: Option<u64>,

    /// Only count quarantined records in the range
    #[arg(long)]
    check: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();

    let range = match args.to {
        Some(to) => BlockRange::new(args.from, to).context("Invalid block range")?,
        None => BlockRange::from(args.from),
    };

    let store = Arc::new(
        RocksStore::open(&args.data_dir)
            .with_context(|| format!("Failed to open store at {}", args.data_dir.display()))?,
    );
    let storage = Storage::from_rocks(store.clone());

    if args.check {
        println!("✓ Store opened successfully");
        println!("  Approximate keys: {}", store.approximate_count()?);
        let quarantined = storage
            .normalized
            .query(args.chain_id, range, Some(DecodeStatus::Quarantined))
            .context("Failed to query normalized store")?
            .len();
        println!(
            "Chain {} {}: {} quarantined records",
            args.chain_id, range, quarantined
        );
        return Ok(());
    }

    let Some(schema_path) = args.schema else {
        anyhow::bail!("--schema is required unless --check is given");
    };
    let registry = InMemorySchemaRegistry::from_file(&schema_path)
        .with_context(|| format!("Failed to load schemas from {}", schema_path.display()))?;
    println!("Loaded {} schemas from {}", registry.len(), schema_path.display());

    let key = SourceKey::new(args.source_id, args.chain_id);
    let lock = ReconciliationLocks::default().lock_for(&key);
    let mut commit = CommitPipeline::new(key, storage.clone(), CommitConfig::default(), lock)
        .context("Failed to open commit pipeline")?;

    let replayer = QuarantineReplayer::new(storage, Decoder::new(Arc::new(registry)));
    let report = replayer
        .replay(args.chain_id, range, &mut commit)
        .context("Quarantine replay failed")?;
    store.flush().context("Failed to flush store")?;

    println!("✓ Reprocessed chain {} {}", args.chain_id, range);
    println!("  Raw records examined: {}", report.examined);
    println!("  Resolved: {}", report.resolved);
    println!("  Still quarantined: {}", report.still_quarantined);
    println!("  Records rewritten: {}", report.written);

    Ok(())
}
