// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the HTTP surface and for sync runs.
//
// METRIC TYPES USED:
// - Counter:   runs and product outcomes (only goes up)
// - Histogram: run, batch and query latency
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::models::SyncReport;

// =============================================================================
// METRIC NAMES
// =============================================================================

/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Labels: mode (full/page), outcome (completed/empty/<error code>)
pub const SYNC_RUNS_TOTAL: &str = "catalog_sync_runs_total";

/// Labels: kind (new/updated/unchanged/deleted/deactivated/skipped_excluded)
pub const SYNC_PRODUCTS_TOTAL: &str = "catalog_sync_products_total";

/// Labels: mode
pub const SYNC_DURATION_SECONDS: &str = "catalog_sync_duration_seconds";

pub const SYNC_BATCH_DURATION_SECONDS: &str = "catalog_sync_batch_duration_seconds";

/// Labels: operation (select/upsert/delete)
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Install the Prometheus recorder and return the render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    // Full runs walk the whole remote catalog, so they need a longer tail
    let run_buckets = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(SYNC_BATCH_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(Matcher::Full(SYNC_DURATION_SECONDS.to_string()), run_buckets)?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_counter!(SYNC_RUNS_TOTAL, "Catalog sync runs by mode and outcome");
    describe_counter!(SYNC_PRODUCTS_TOTAL, "Products handled by catalog sync, by outcome");
    describe_histogram!(SYNC_DURATION_SECONDS, "Wall time of a catalog sync run in seconds");
    describe_histogram!(SYNC_BATCH_DURATION_SECONDS, "Wall time of one upsert batch in seconds");
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Database query latency in seconds");

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================
// Without an installed recorder (unit tests) these are no-ops.

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

/// Record the end of a run, successful or not
pub fn record_sync_run(mode: &'static str, outcome: &'static str, duration_secs: f64) {
    counter!(SYNC_RUNS_TOTAL, "mode" => mode, "outcome" => outcome).increment(1);
    histogram!(SYNC_DURATION_SECONDS, "mode" => mode).record(duration_secs);
}

/// Add a completed run's counts to the product counters
pub fn record_sync_report(report: &SyncReport) {
    let kinds = [
        ("new", report.new),
        ("updated", report.updated),
        ("unchanged", report.unchanged),
        ("deleted", report.deleted),
        ("deactivated", report.deactivated),
        ("skipped_excluded", report.skipped_excluded),
    ];
    for (kind, count) in kinds {
        counter!(SYNC_PRODUCTS_TOTAL, "kind" => kind).increment(count as u64);
    }
}

pub fn record_sync_batch(duration_secs: f64) {
    histogram!(SYNC_BATCH_DURATION_SECONDS).record(duration_secs);
}

pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}
