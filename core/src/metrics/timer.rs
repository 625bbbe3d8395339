//! RAII guard that records elapsed time to a Prometheus histogram on drop.

use prometheus::HistogramVec;
use std::time::Instant;

use super::definitions::STORE_OPERATIONS_TOTAL;

/// Records the elapsed duration to a histogram when dropped.
/// Use `finish()` to record early together with the outcome.
pub struct TimerGuard<'a> {
    histogram: &'a HistogramVec,
    labels: Vec<String>,
    start: Instant,
    stopped: bool,
}

impl<'a> TimerGuard<'a> {
    pub fn new(histogram: &'a HistogramVec, labels: &[&str]) -> Self {
        Self {
            histogram,
            labels: labels.iter().map(|s| s.to_string()).collect(),
            start: Instant::now(),
            stopped: false,
        }
    }

    /// Stop the timer, record the duration and count the operation by status.
    /// Returns elapsed seconds.
    pub fn finish(mut self, success: bool) -> f64 {
        self.stopped = true;
        let elapsed = self.observe();

        let status = if success { "success" } else { "error" };
        let operation = self.labels.first().map(|s| s.as_str()).unwrap_or("unknown");
        STORE_OPERATIONS_TOTAL.with_label_values(&[operation, status]).inc();

        elapsed
    }

    fn observe(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        let label_refs: Vec<&str> = self.labels.iter().map(|s| s.as_str()).collect();
        self.histogram.with_label_values(&label_refs).observe(elapsed);
        elapsed
    }
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        if !self.stopped {
            self.observe();
        }
    }
}
