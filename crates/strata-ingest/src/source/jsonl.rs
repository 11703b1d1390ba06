//! JSONL raw record source.
//!
//! Replays recorded [`RawRecord`]s, one JSON object per line, from a file or
//! a directory of `.jsonl`/`.json`/`.ndjson` files (sorted by name). The
//! stream is finite. Records for another chain are skipped, and every
//! record is re-stamped with this source's id.

use super::{RecordSink, RecordStream};
use crate::{Error, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use strata_core::{BlockRange, RawRecord, SourceKey};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Configuration for the JSONL source.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    /// Input file or directory path.
    pub input: PathBuf,

    pub start_block: u64,

    /// Continue past lines that fail to parse (log and skip).
    pub continue_on_error: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            start_block: 0,
            continue_on_error: true,
        }
    }
}

/// Recorded raw records on disk.
#[derive(Debug, Clone)]
pub struct JsonlSource {
    key: SourceKey,
    config: JsonlConfig,
}

impl JsonlSource {
    pub fn new(key: SourceKey, config: JsonlConfig) -> Self {
        Self { key, config }
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn config(&self) -> &JsonlConfig {
        &self.config
    }

    pub fn subscribe(&self, from: u64) -> RecordStream {
        self.replay(BlockRange::from(from))
    }

    pub fn backfill(&self, range: BlockRange) -> RecordStream {
        self.replay(range)
    }

    fn replay(&self, range: BlockRange) -> RecordStream {
        let key = self.key.clone();
        let config = self.config.clone();
        RecordStream::spawn(move |sink| async move {
            let files = collect_files(&config.input)?;
            let mut stats = JsonlStats::default();
            for file in &files {
                read_file(file, &key, &config, range, &sink, &mut stats).await?;
            }
            info!(
                "{}: replayed {} files: {} lines, {} records sent, {} skipped, {} errors",
                key,
                files.len(),
                stats.lines,
                stats.sent,
                stats.skipped,
                stats.errors
            );
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct JsonlStats {
    lines: usize,
    sent: usize,
    skipped: usize,
    errors: usize,
}

/// Collect input files, sorted for a deterministic order.
fn collect_files(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Input path does not exist: {}", input.display()),
        )));
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(input)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext == "jsonl" || ext == "json" || ext == "ndjson")
        })
        .collect();
    files.sort();
    Ok(files)
}

async fn read_file(
    path: &Path,
    key: &SourceKey,
    config: &JsonlConfig,
    range: BlockRange,
    sink: &RecordSink,
    stats: &mut JsonlStats,
) -> Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut line_num = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_num += 1;
        if line.trim().is_empty() {
            continue;
        }
        stats.lines += 1;

        let mut record: RawRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                stats.errors += 1;
                warn!("{}:{}: JSON parse error: {}", path.display(), line_num, e);
                if config.continue_on_error {
                    continue;
                }
                return Err(Error::Json(e));
            }
        };

        if record.chain_id != key.chain_id || !range.contains(record.block_number) {
            stats.skipped += 1;
            continue;
        }
        record.source_id = key.source_id.clone();
        record.ingested_at = Utc::now();
        sink.send(record).await?;
        stats.sent += 1;
    }
    Ok(())
}
