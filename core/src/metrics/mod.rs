//! Prometheus metrics for batch operations.
//!
//! # Usage
//!
//! ```ignore
//! use batchwright::metrics::store;
//!
//! // Time a store round trip, duration recorded on drop
//! let _timer = store::time_store_operation(store::ops::CREATE_MANY);
//!
//! // Count outcomes
//! store::record_outcome("upsert_many", "created", 10);
//! ```

pub mod definitions;
pub mod store;
pub mod timer;

pub use timer::TimerGuard;

use prometheus::{Encoder, TextEncoder};

/// Encode all metrics to a string in the Prometheus text exposition format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
