//! Prometheus metrics helpers for Strata.
//!
//! # Usage
//!
//! ```rust,ignore
//! use strata_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handle = init_metrics()?;
//!     start_metrics_server(9091, handle).await?;
//!
//!     metrics::counter!("ingest_records_total").increment(1);
//!     Ok(())
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: pipeline stage (`ingest_`, `sequence_`, `decode_`, `commit_`,
//!   `reorg_`, `source_`, `worker_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: `source` on per-worker metrics only; never block numbers or hashes

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Fails if a recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_common_metrics();
    Ok(handle)
}

/// Like [`init_metrics`] but returns `None` when a recorder is already
/// installed. Useful for tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    init_metrics().ok()
}

/// Serve `/metrics` on `port` from a background task.
///
/// The listener is bound before returning, so a port conflict surfaces here.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

fn register_common_metrics() {
    // =========================================================================
    // Ingestion
    // =========================================================================

    describe_counter!(
        "ingest_records_total",
        "Raw records received from sources (label: source)"
    );
    describe_counter!(
        "ingest_records_duplicate_total",
        "Records dropped by the deduplicator"
    );
    describe_counter!(
        "ingest_records_stale_total",
        "Records older than the tracked reorg window, dropped"
    );
    describe_gauge!(
        "ingest_queue_depth",
        "Records waiting between ingress and processing"
    );

    // =========================================================================
    // Sequencing
    // =========================================================================

    describe_counter!(
        "sequence_gaps_total",
        "Out-of-order records buffered ahead of the tracked position"
    );
    describe_counter!(
        "sequence_backfills_requested_total",
        "Backfill ranges requested from sources"
    );

    // =========================================================================
    // Decoding
    // =========================================================================

    describe_counter!(
        "decode_records_ok_total",
        "Normalized records decoded successfully"
    );
    describe_counter!(
        "decode_records_quarantined_total",
        "Normalized records quarantined for later replay"
    );
    describe_counter!(
        "decode_quarantine_replayed_total",
        "Quarantined records re-decoded successfully"
    );

    // =========================================================================
    // Commit
    // =========================================================================

    describe_counter!("commit_batches_total", "Batches finalized");
    describe_counter!(
        "commit_records_raw_total",
        "Raw records written to the bronze store"
    );
    describe_counter!(
        "commit_records_normalized_total",
        "Normalized records written to the silver store"
    );
    describe_histogram!(
        "commit_batch_duration_seconds",
        "Time from pending marker to finalized batch"
    );
    describe_counter!(
        "commit_checkpoint_conflicts_total",
        "Checkpoint compare-and-set conflicts"
    );
    describe_counter!(
        "commit_batches_recovered_total",
        "Journal entries recovered at startup (label: action)"
    );
    describe_gauge!(
        "checkpoint_block",
        "Committed checkpoint block number (label: source)"
    );

    // =========================================================================
    // Reorgs
    // =========================================================================

    describe_counter!("reorg_events_total", "Reorganizations detected");
    describe_counter!(
        "reorg_records_retracted_total",
        "Records retracted by reconciliation (label: store)"
    );
    describe_gauge!(
        "reorg_reconciling",
        "Whether a source is reconciling (1=yes, 0=no, label: source)"
    );

    // =========================================================================
    // Sources and workers
    // =========================================================================

    describe_counter!(
        "source_reconnects_total",
        "Source subscriptions re-established after a failure"
    );
    describe_counter!(
        "source_timeouts_total",
        "Source calls that exceeded their deadline"
    );
    describe_counter!("worker_halted_total", "Workers halted by a fatal fault");
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Increment a counter labelled with a source.
#[inline]
pub fn increment_for(name: &'static str, source: &str, count: u64) {
    metrics::counter!(name, "source" => source.to_string()).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

/// Set a gauge labelled with a source.
#[inline]
pub fn set_gauge_for(name: &'static str, source: &str, value: f64) {
    metrics::gauge!(name, "source" => source.to_string()).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_helpers_do_not_panic() {
        ensure_metrics_init();
        increment("test_counter", 0);
        increment("test_counter", 100);
        increment_for("test_counter_labelled", "ws@1", 1);
        set_gauge("test_gauge", 42.5);
        set_gauge_for("test_gauge_labelled", "ws@1", f64::MAX);
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }
}
