//! Store round trip and batch outcome helpers.

use super::definitions::{RATE_LIMITER_WAITS_TOTAL, RECORDS_TOTAL, STORE_OPERATION_DURATION};
use super::timer::TimerGuard;

/// Store operation names for labeling.
pub mod ops {
    pub const FIND_MANY: &str = "find_many";
    pub const CREATE_MANY: &str = "create_many";
    pub const UPDATE: &str = "update";
    pub const DELETE_MANY: &str = "delete_many";
    pub const TRANSACTION: &str = "transaction";
    pub const EXECUTE_RAW: &str = "execute_raw";
}

/// Create a timer for a store round trip. Records duration on drop.
pub fn time_store_operation<'a>(operation: &str) -> TimerGuard<'a> {
    TimerGuard::new(&STORE_OPERATION_DURATION, &[operation])
}

/// Count records by outcome for a batch operation.
pub fn record_outcome(operation: &str, outcome: &str, count: usize) {
    if count == 0 {
        return;
    }
    RECORDS_TOTAL.with_label_values(&[operation, outcome]).inc_by(count as f64);
}

pub fn record_rate_limiter_wait() {
    RATE_LIMITER_WAITS_TOTAL.inc();
}
