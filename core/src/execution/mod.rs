pub mod parallel;
pub mod rate_limiter;
pub mod retry;
