//! Token-bucket admission control for store round trips.

use std::sync::Mutex;

use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::metrics::store::record_rate_limiter_wait;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum RateLimiterError {
    #[error("Rate must be a positive finite number, got {0}")]
    InvalidRate(f64),

    #[error("Capacity must be a positive finite number, got {0}")]
    InvalidCapacity(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterStatus {
    pub available: u64,
    pub total: f64,
    pub utilization: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled continuously from wall-clock time.
///
/// `0 <= tokens <= capacity` holds at every observation: refill clamps to the
/// capacity and a token is only taken while holding the lock after a check.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate_per_ms: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Bucket that admits `per_second` operations per second with a burst of the same size.
    pub fn new(per_second: f64) -> Result<Self, RateLimiterError> {
        Self::with_capacity(per_second, per_second)
    }

    pub fn with_capacity(capacity: f64, per_second: f64) -> Result<Self, RateLimiterError> {
        if !per_second.is_finite() || per_second <= 0.0 {
            return Err(RateLimiterError::InvalidRate(per_second));
        }
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(RateLimiterError::InvalidCapacity(capacity));
        }

        Ok(Self {
            capacity,
            refill_rate_per_ms: per_second / 1000.0,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
        })
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        // the state is two plain numbers so a poisoned lock is still consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed_ms = now.saturating_duration_since(state.last_refill).as_secs_f64() * 1000.0;
        state.tokens = (state.tokens + elapsed_ms * self.refill_rate_per_ms).min(self.capacity);
        state.last_refill = now;
    }

    /// Takes a token if one is available without waiting, otherwise returns the
    /// time until one will be.
    fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.lock();
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }

        let wait_ms = ((1.0 - state.tokens) / self.refill_rate_per_ms).ceil().max(1.0);
        Err(Duration::from_millis(wait_ms as u64))
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&self) {
        let mut waited = false;
        loop {
            match self.try_take() {
                Ok(()) => return,
                Err(wait) => {
                    if !waited {
                        record_rate_limiter_wait();
                        waited = true;
                    }
                    debug!("Rate limiter: waiting {}ms for a token", wait.as_millis());
                    sleep(wait).await;
                }
            }
        }
    }

    pub fn status(&self) -> RateLimiterStatus {
        let mut state = self.lock();
        self.refill(&mut state);

        RateLimiterStatus {
            available: state.tokens.floor().max(0.0) as u64,
            total: self.capacity,
            utilization: 1.0 - state.tokens / self.capacity,
        }
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.tokens = self.capacity;
        state.last_refill = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_rate() {
        assert_eq!(TokenBucket::new(0.0).unwrap_err(), RateLimiterError::InvalidRate(0.0));
        assert!(TokenBucket::new(-5.0).is_err());
        assert!(TokenBucket::new(f64::INFINITY).is_err());
        assert!(TokenBucket::new(f64::NAN).is_err());
        assert!(TokenBucket::with_capacity(0.0, 10.0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_throttle() {
        let bucket = TokenBucket::new(10.0).unwrap();

        let start = Instant::now();
        for _ in 0..10 {
            bucket.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));

        let before_eleventh = Instant::now();
        bucket.acquire().await;
        let waited = before_eleventh.elapsed();
        assert!(waited >= Duration::from_millis(90), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(150), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_stays_in_bounds() {
        let bucket = TokenBucket::new(5.0).unwrap();

        for step in 0..40u64 {
            if step % 3 == 0 {
                tokio::time::advance(Duration::from_millis(step * 37)).await;
            }
            bucket.acquire().await;

            let status = bucket.status();
            assert!(status.available as f64 <= status.total);
            assert!((0.0..=1.0).contains(&status.utilization), "{:?}", status);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_clamped_to_capacity() {
        let bucket = TokenBucket::new(4.0).unwrap();
        bucket.acquire().await;
        tokio::time::advance(Duration::from_secs(60)).await;

        let status = bucket.status();
        assert_eq!(status.available, 4);
        assert_eq!(status.utilization, 0.0);
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_overdraw() {
        use std::sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        };

        // 3 tokens, one more every 334ms
        let bucket = Arc::new(TokenBucket::new(3.0).unwrap());
        let admitted = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let handles: Vec<_> = (0..7)
            .map(|_| {
                let bucket = bucket.clone();
                let admitted = admitted.clone();
                tokio::spawn(async move {
                    bucket.acquire().await;
                    admitted.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        sleep(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(admitted.load(Ordering::SeqCst), 3);
        let status = bucket.status();
        assert_eq!(status.available, 0);
        assert!(status.utilization <= 1.0, "tokens went negative: {:?}", status);

        tokio::time::advance(Duration::from_millis(334)).await;
        settle().await;
        assert_eq!(admitted.load(Ordering::SeqCst), 4);
        assert!(bucket.status().utilization <= 1.0);

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 7);
        assert!(start.elapsed() >= Duration::from_millis(1300), "{:?}", start.elapsed());
        assert!(bucket.status().utilization <= 1.0);
    }

    #[tokio::test]
    async fn test_reset_restores_capacity() {
        let bucket = TokenBucket::new(2.0).unwrap();
        bucket.acquire().await;
        bucket.acquire().await;
        assert_eq!(bucket.status().available, 0);

        bucket.reset();
        assert_eq!(bucket.status().available, 2);
    }
}
