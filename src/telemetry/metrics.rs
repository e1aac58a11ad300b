//! `metrics` facade recording for coordinator events.
//!
//! Exporters are installed by the embedding process; without one these calls
//! are no-ops. The ledger keeps its own counters for the status report.

use std::time::Duration;

pub fn record_lease_granted(model: &str) {
    ::metrics::counter!("residency_leases_granted_total", "model" => model.to_string()).increment(1);
}

pub fn record_eviction(model: &str) {
    ::metrics::counter!("residency_evictions_total", "model" => model.to_string()).increment(1);
}

pub fn record_admission_timeout(model: &str) {
    ::metrics::counter!("residency_admission_timeouts_total", "model" => model.to_string())
        .increment(1);
}

pub fn record_load_failure(model: &str) {
    ::metrics::counter!("residency_load_failures_total", "model" => model.to_string()).increment(1);
}

pub fn record_unload_failure(model: &str) {
    ::metrics::counter!("residency_unload_failures_total", "model" => model.to_string())
        .increment(1);
}

pub fn record_load_latency(model: &str, elapsed: Duration) {
    ::metrics::histogram!("residency_load_seconds", "model" => model.to_string())
        .record(elapsed.as_secs_f64());
}

/// Publish current budget usage gauges.
pub fn record_usage(used_mb: u64, budget_mb: u64) {
    ::metrics::gauge!("residency_used_mb").set(used_mb as f64);
    ::metrics::gauge!("residency_budget_mb").set(budget_mb as f64);
}
