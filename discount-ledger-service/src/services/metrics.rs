//! Prometheus metrics for discount-ledger-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Calculation runs started, by outcome of the lock acquisition.
pub static RUNS_STARTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "discount_ledger_runs_started_total",
        "Total number of calculation runs started",
        &["outcome"] // acquired, conflict
    )
    .expect("Failed to register runs_started_total")
});

/// Finalize calls, by result.
pub static FINALIZE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "discount_ledger_finalize_total",
        "Total number of finalize calls",
        &["status"] // ok, error
    )
    .expect("Failed to register finalize_total")
});

/// Per-row reconciliation outcomes across all finalize calls.
pub static RECONCILE_ROWS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "discount_ledger_reconcile_rows_total",
        "Staging rows resolved by the reconciliation engine",
        &["outcome"] // promoted, compensated, discarded
    )
    .expect("Failed to register reconcile_rows_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "discount_ledger_errors_total",
        "Total number of errors by type",
        &["error_type"] // db_error, conflict, not_found, ...
    )
    .expect("Failed to register errors_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "discount_ledger_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&RUNS_STARTED_TOTAL);
    Lazy::force(&FINALIZE_TOTAL);
    Lazy::force(&RECONCILE_ROWS_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
