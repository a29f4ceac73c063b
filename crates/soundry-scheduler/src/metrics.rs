//! Prometheus metrics for the scheduler.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}

/// Metric names as constants for consistency.
pub mod names {
    // Admission
    pub const SUBMISSIONS_TOTAL: &str = "soundry_submissions_total";

    // Dispatcher
    pub const DISPATCH_RUNS_TOTAL: &str = "soundry_dispatch_runs_total";
    pub const DISPATCH_PROMOTIONS_TOTAL: &str = "soundry_dispatch_promotions_total";
    pub const DISPATCH_ENQUEUE_FAILURES_TOTAL: &str = "soundry_dispatch_enqueue_failures_total";
    pub const DISPATCH_QUEUED_ITEMS: &str = "soundry_dispatch_queued_items";
    pub const DISPATCH_RUN_SECONDS: &str = "soundry_dispatch_run_seconds";

    // Cleanup
    pub const CLEANUP_RECLAIMED_TOTAL: &str = "soundry_cleanup_reclaimed_total";
    pub const CLEANUP_ERRORS_TOTAL: &str = "soundry_cleanup_errors_total";
}

/// Record an accepted submission; `kind` is `track` or `playlist`.
pub fn record_submission(kind: &'static str, tracks: usize) {
    counter!(names::SUBMISSIONS_TOTAL, "kind" => kind).increment(tracks as u64);
}

pub fn record_dispatch_run(queued: usize, duration_secs: f64) {
    counter!(names::DISPATCH_RUNS_TOTAL).increment(1);
    gauge!(names::DISPATCH_QUEUED_ITEMS).set(queued as f64);
    histogram!(names::DISPATCH_RUN_SECONDS).record(duration_secs);
}

pub fn record_promotion(grouped: bool) {
    let labels = [("grouped", grouped.to_string())];
    counter!(names::DISPATCH_PROMOTIONS_TOTAL, &labels).increment(1);
}

pub fn record_enqueue_failure() {
    counter!(names::DISPATCH_ENQUEUE_FAILURES_TOTAL).increment(1);
}

/// `reason` is `expired`, `cancelled` or `over_cap`.
pub fn record_reclaimed(reason: &'static str) {
    counter!(names::CLEANUP_RECLAIMED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_cleanup_error() {
    counter!(names::CLEANUP_ERRORS_TOTAL).increment(1);
}
