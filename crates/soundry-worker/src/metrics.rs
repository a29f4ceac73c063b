//! Prometheus metrics for the download worker.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::identity_pool::PoolStats;

/// Install the recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}

/// Metric names as constants for consistency.
pub mod names {
    // Job metrics
    pub const JOBS_STARTED_TOTAL: &str = "soundry_jobs_started_total";
    pub const JOBS_FINISHED_TOTAL: &str = "soundry_jobs_finished_total";
    pub const JOBS_FAILED_TOTAL: &str = "soundry_jobs_failed_total";
    pub const JOBS_RESCHEDULED_TOTAL: &str = "soundry_jobs_rescheduled_total";
    pub const JOB_DURATION_SECONDS: &str = "soundry_job_duration_seconds";

    // Step metrics
    pub const DOWNLOAD_DURATION_SECONDS: &str = "soundry_download_duration_seconds";
    pub const TRANSCODE_DURATION_SECONDS: &str = "soundry_transcode_duration_seconds";
    pub const CACHE_LOOKUPS_TOTAL: &str = "soundry_cache_lookups_total";

    // Identity pool metrics
    pub const IDENTITIES: &str = "soundry_identities";
    pub const IDENTITY_TIMEOUTS_TOTAL: &str = "soundry_identity_acquire_timeouts_total";

    // Circuit breaker
    pub const CIRCUIT_OPEN: &str = "soundry_circuit_open";
}

pub fn record_job_started() {
    counter!(names::JOBS_STARTED_TOTAL).increment(1);
}

/// Record a finished job with its outcome label (completed, deduplicated, cancelled).
pub fn record_job_finished(outcome: &str, duration_secs: f64) {
    let labels = [("outcome", outcome.to_string())];
    counter!(names::JOBS_FINISHED_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_job_failed(retryable: bool) {
    let labels = [("retryable", retryable.to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_job_rescheduled() {
    counter!(names::JOBS_RESCHEDULED_TOTAL).increment(1);
}

pub fn record_download_duration(duration_secs: f64) {
    histogram!(names::DOWNLOAD_DURATION_SECONDS).record(duration_secs);
}

pub fn record_transcode_duration(format: &str, duration_secs: f64) {
    let labels = [("format", format.to_string())];
    histogram!(names::TRANSCODE_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_cache_lookup(namespace: &str, hit: bool) {
    let labels = [
        ("namespace", namespace.to_string()),
        ("result", if hit { "hit" } else { "miss" }.to_string()),
    ];
    counter!(names::CACHE_LOOKUPS_TOTAL, &labels).increment(1);
}

pub fn record_identity_timeout() {
    counter!(names::IDENTITY_TIMEOUTS_TOTAL).increment(1);
}

/// Update the identity gauges, one series per status.
pub fn record_identity_stats(stats: &PoolStats) {
    for (status, count) in [
        ("available", stats.available),
        ("busy", stats.busy),
        ("cooling_down", stats.cooling_down),
        ("disabled", stats.disabled),
    ] {
        let labels = [("status", status.to_string())];
        gauge!(names::IDENTITIES, &labels).set(count as f64);
    }
}

pub fn record_breaker_state(open: bool) {
    gauge!(names::CIRCUIT_OPEN).set(if open { 1.0 } else { 0.0 });
}
