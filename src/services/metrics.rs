//! Prometheus metrics for the reconciliation core.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for store operation duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "recon_core_db_query_duration_seconds",
        "Store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for reconciliation lifecycle operations.
pub static RECONCILIATION_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_core_reconciliation_operations_total",
        "Total number of reconciliation operations",
        &["operation", "status"]
    )
    .expect("Failed to register RECONCILIATION_OPERATIONS")
});

/// Counter for committed transaction matches.
pub static TRANSACTION_MATCHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_core_transaction_matches_total",
        "Total number of transaction matches",
        &["rule_id"]
    )
    .expect("Failed to register TRANSACTION_MATCHES")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_core_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&RECONCILIATION_OPERATIONS);
    Lazy::force(&TRANSACTION_MATCHES);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Record a reconciliation lifecycle operation.
pub fn record_reconciliation_operation(operation: &str, status: &str) {
    RECONCILIATION_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
