//! Prometheus metric definitions for batchwright.
//!
//! All metric registrations are centralized here for discoverability.
//! Metrics are lazily initialized on first access.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    HistogramVec,
};

// =============================================================================
// Store Metrics
// =============================================================================

/// Total store round trips.
/// Labels: operation, status (success/error)
pub static STORE_OPERATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "batchwright_store_operations_total",
        "Total store round trips",
        &["operation", "status"]
    )
    .expect("failed to register STORE_OPERATIONS_TOTAL")
});

/// Store round trip duration in seconds.
/// Labels: operation
pub static STORE_OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "batchwright_store_operation_duration_seconds",
        "Store round trip duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("failed to register STORE_OPERATION_DURATION")
});

// =============================================================================
// Batch Metrics
// =============================================================================

/// Records processed by batch operations.
/// Labels: operation, outcome (created/updated/unchanged/deleted/failed/duplicate)
pub static RECORDS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "batchwright_records_total",
        "Records processed by batch operations",
        &["operation", "outcome"]
    )
    .expect("failed to register RECORDS_TOTAL")
});

/// Times a caller had to wait for a rate limiter token.
pub static RATE_LIMITER_WAITS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "batchwright_rate_limiter_waits_total",
        "Times a caller had to wait for a rate limiter token"
    )
    .expect("failed to register RATE_LIMITER_WAITS_TOTAL")
});
