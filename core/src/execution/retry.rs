use std::future::Future;

use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

use crate::{
    config::RetryPolicy,
    events::{BatchEvent, EventReporter},
    store::StoreError,
};

/// Runs `operation`, retrying with exponential backoff while it fails with a
/// retryable store error. Any other error is returned on first occurrence.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &'static str,
    reporter: &dyn EventReporter,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{} succeeded after {} attempt(s)", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let backoff = jittered(policy.backoff(attempt));
                reporter.report(&BatchEvent::TransientRetry {
                    operation: operation_name,
                    attempt,
                    delay_ms: backoff.as_millis() as u64,
                    message: e.message.clone(),
                });
                sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    error!("{} failed after {} attempt(s): {}", operation_name, attempt, e);
                }
                return Err(e);
            }
        }
    }
}

/// Adds up to 10% random jitter so concurrent retries do not line up.
fn jittered(backoff: Duration) -> Duration {
    let max_jitter = backoff.as_millis() as u64 / 10;
    if max_jitter == 0 {
        return backoff;
    }
    backoff + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
}
