//! Bounded-concurrency execution of independent store operations.
//!
//! Operations are dispatched in waves of at most `concurrency` futures, all
//! polled on the calling task. Wave `k + 1` is not started until every
//! operation of wave `k` has settled, so the number of in-flight round trips
//! never exceeds the configured limit. A failing or panicking operation is
//! recorded against its index and never aborts its siblings.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicUsize, Ordering},
};

use futures::{future::join_all, FutureExt};
use tokio::time::Instant;
use tracing::debug;

use crate::execution::rate_limiter::TokenBucket;

/// Why an operation did not produce a value.
#[derive(thiserror::Error, Debug)]
pub enum OperationFailure<E> {
    #[error("{0}")]
    Failed(E),

    #[error("operation panicked: {0}")]
    Panicked(String),

    /// Not started because an earlier wave failed and `stop_on_error` was set.
    #[error("skipped after an earlier failure")]
    Skipped,
}

#[derive(Debug)]
pub struct IndexedFailure<E> {
    pub index: usize,
    pub failure: OperationFailure<E>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExecutionMetrics {
    pub total_time_ms: f64,
    pub sequential_estimate_ms: f64,
    pub speedup_factor: f64,
    pub items_per_second: f64,
    pub parallel_efficiency: f64,
    pub connection_utilization: f64,
    pub concurrency: usize,
    pub waves: usize,
    pub peak_in_flight: usize,
}

#[derive(Debug)]
pub struct ExecutionResult<T, E> {
    /// Successful values with the index of the operation that produced them, ascending.
    pub results: Vec<(usize, T)>,
    /// Failures with the index of the operation, ascending.
    pub errors: Vec<IndexedFailure<E>>,
    pub metrics: ExecutionMetrics,
}

impl<T, E> ExecutionResult<T, E> {
    fn empty() -> Self {
        Self { results: Vec::new(), errors: Vec::new(), metrics: ExecutionMetrics::default() }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.results.iter().map(|(_, value)| value)
    }
}

pub struct ExecutionOptions<'a, E> {
    pub concurrency: Option<usize>,
    pub rate_limiter: Option<&'a TokenBucket>,
    /// Called after every wave with `(completed, total)`.
    pub on_progress: Option<&'a (dyn Fn(usize, usize) + Send + Sync)>,
    /// Called for every failed operation with the error and the operation index.
    pub on_error: Option<&'a (dyn Fn(&E, usize) + Send + Sync)>,
    /// Skip the remaining waves once a wave reports a failure.
    pub stop_on_error: bool,
}

impl<E> Default for ExecutionOptions<'_, E> {
    fn default() -> Self {
        Self {
            concurrency: None,
            rate_limiter: None,
            on_progress: None,
            on_error: None,
            stop_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParallelExecutor {
    default_concurrency: usize,
}

impl ParallelExecutor {
    pub fn new(default_concurrency: usize) -> Self {
        Self { default_concurrency: default_concurrency.max(1) }
    }

    pub fn default_concurrency(&self) -> usize {
        self.default_concurrency
    }

    pub async fn run<T, E, F, Fut>(
        &self,
        operations: Vec<F>,
        options: ExecutionOptions<'_, E>,
    ) -> ExecutionResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let total = operations.len();
        if total == 0 {
            return ExecutionResult::empty();
        }

        let concurrency = options.concurrency.unwrap_or(self.default_concurrency).max(1);
        let started = Instant::now();
        let in_flight = AtomicUsize::new(0);
        let peak_in_flight = AtomicUsize::new(0);

        let mut result = ExecutionResult::empty();
        let mut durations_ms: Vec<f64> = Vec::with_capacity(total);
        let mut completed = 0;
        let mut waves = 0;
        let mut operations = operations.into_iter().enumerate().peekable();

        while operations.peek().is_some() {
            let wave: Vec<(usize, F)> = operations.by_ref().take(concurrency).collect();
            let wave_len = wave.len();
            waves += 1;

            debug!(
                "Dispatching wave {} with {} operation(s), {}/{} completed",
                waves, wave_len, completed, total
            );

            let futures = wave.into_iter().map(|(index, operation)| {
                let in_flight = &in_flight;
                let peak_in_flight = &peak_in_flight;
                let rate_limiter = options.rate_limiter;
                async move {
                    if let Some(limiter) = rate_limiter {
                        limiter.acquire().await;
                    }

                    let now_in_flight = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
                    let op_started = Instant::now();

                    let outcome = AssertUnwindSafe(async move { operation().await })
                        .catch_unwind()
                        .await;

                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let elapsed_ms = op_started.elapsed().as_secs_f64() * 1000.0;

                    let outcome = match outcome {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(OperationFailure::Failed(e)),
                        Err(panic) => Err(OperationFailure::Panicked(panic_message(panic))),
                    };
                    (index, elapsed_ms, outcome)
                }
            });

            let mut wave_failed = false;
            for (index, elapsed_ms, outcome) in join_all(futures).await {
                durations_ms.push(elapsed_ms);
                match outcome {
                    Ok(value) => result.results.push((index, value)),
                    Err(failure) => {
                        wave_failed = true;
                        if let (Some(on_error), OperationFailure::Failed(e)) =
                            (options.on_error, &failure)
                        {
                            on_error(e, index);
                        }
                        result.errors.push(IndexedFailure { index, failure });
                    }
                }
            }

            completed += wave_len;
            if let Some(on_progress) = options.on_progress {
                on_progress(completed, total);
            }

            if wave_failed && options.stop_on_error && operations.peek().is_some() {
                for (index, _) in operations.by_ref() {
                    result
                        .errors
                        .push(IndexedFailure { index, failure: OperationFailure::Skipped });
                }
                debug!("Skipped {} operation(s) after a failed wave", total - completed);
                if let Some(on_progress) = options.on_progress {
                    on_progress(total, total);
                }
                break;
            }
        }

        result.results.sort_by_key(|(index, _)| *index);
        result.errors.sort_by_key(|failure| failure.index);
        result.metrics = compute_metrics(
            started.elapsed().as_secs_f64() * 1000.0,
            &durations_ms,
            total,
            concurrency,
            waves,
            peak_in_flight.load(Ordering::SeqCst),
        );

        result
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn compute_metrics(
    total_time_ms: f64,
    durations_ms: &[f64],
    operation_count: usize,
    concurrency: usize,
    waves: usize,
    peak_in_flight: usize,
) -> ExecutionMetrics {
    let sequential_estimate_ms = if durations_ms.is_empty() {
        0.0
    } else {
        let mean = durations_ms.iter().sum::<f64>() / durations_ms.len() as f64;
        mean * operation_count as f64
    };

    let speedup_factor = if durations_ms.is_empty() || total_time_ms <= 0.0 {
        1.0
    } else {
        (sequential_estimate_ms / total_time_ms).max(0.0)
    };

    let items_per_second =
        if total_time_ms > 0.0 { operation_count as f64 * 1000.0 / total_time_ms } else { 0.0 };

    let effective_parallelism = concurrency.min(operation_count).max(1) as f64;

    ExecutionMetrics {
        total_time_ms,
        sequential_estimate_ms,
        speedup_factor,
        items_per_second,
        parallel_efficiency: (speedup_factor / effective_parallelism).clamp(0.0, 1.0),
        connection_utilization: (peak_in_flight as f64 / concurrency as f64).clamp(0.0, 1.0),
        concurrency,
        waves,
        peak_in_flight,
    }
}
