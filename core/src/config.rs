use std::{env, fs, path::Path, time::Duration};

use dotenv::dotenv;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_QUERIES_PER_SECOND: f64 = 100.0;

pub fn connection_string() -> Result<String, env::VarError> {
    dotenv().ok();
    let connection = env::var("DATABASE_URL")?;
    Ok(connection)
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("A store connection is required before running batch operations")]
    MissingStore,

    #[error("max_concurrency must be a positive integer, got {0}")]
    InvalidMaxConcurrency(usize),

    #[error("max_queries_per_second must be a positive finite number, got {0}")]
    InvalidMaxQueriesPerSecond(f64),

    #[error("retry.max_attempts must be at least 1")]
    InvalidRetryAttempts,

    #[error("Could not read config file: {0}")]
    CouldNotReadConfigFile(#[from] std::io::Error),

    #[error("Could not parse config file: {0}")]
    CouldNotParseConfigFile(#[from] serde_yaml::Error),
}

/// Exponential backoff for transient store errors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Backoff before retry number `attempt` (1 based): doubles from the initial delay.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.initial_backoff_ms.saturating_mul(1 << exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Options accepted when configuring a batch context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Upper bound on concurrently in-flight store round trips. Derived from
    /// the store's pool size when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    /// Whether multi-chunk operations may run chunks concurrently. Defaults to `true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_parallel: Option<bool>,

    /// Store round trips admitted per second. Defaults to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queries_per_second: Option<f64>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl BatchOptions {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let options: BatchOptions = serde_yaml::from_str(yaml)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(max_concurrency) = self.max_concurrency {
            if max_concurrency == 0 {
                return Err(ConfigError::InvalidMaxConcurrency(max_concurrency));
            }
        }

        if let Some(rate) = self.max_queries_per_second {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ConfigError::InvalidMaxQueriesPerSecond(rate));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryAttempts);
        }

        Ok(())
    }

    pub fn parallel_enabled(&self) -> bool {
        self.enable_parallel.unwrap_or(true)
    }

    pub fn queries_per_second(&self) -> f64 {
        self.max_queries_per_second.unwrap_or(DEFAULT_MAX_QUERIES_PER_SECOND)
    }
}
