//! Retry strategies and backoff policies for cachi2's fetch primitive.
//!
//! This crate is used by `cachi2-checksum::fetch_many` to retry transient
//! network failures (§4.1): 5 attempts, base delay 1s, capped at 32s, full
//! jitter. It also backs a couple of ecosystem-specific places that retry
//! subprocess invocations (e.g. `go mod download` flaking on a proxy
//! hiccup).
//!
//! # Example
//!
//! ```
//! use cachi2_retry::{RetryPolicy, calculate_delay};
//!
//! let config = RetryPolicy::Fetch.to_config();
//! let delay = calculate_delay(&config, 2);
//! println!("retry after: {delay:?}");
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries - retry immediately.
    Immediate,
    /// Exponential backoff: delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Linear backoff: delay increases linearly each attempt.
    Linear,
    /// Constant delay: same delay every attempt.
    Constant,
}

/// Predefined retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// §4.1: 5 attempts, base 1s, cap 32s, full jitter.
    #[default]
    Fetch,
    /// Slower, fewer-attempt policy for driving subprocess tools
    /// (`go`, `yarn`, `cargo`) where each attempt is itself expensive.
    Tool,
    /// Fully custom configuration.
    Custom,
}

impl RetryPolicy {
    pub fn to_config(self) -> RetryStrategyConfig {
        match self {
            RetryPolicy::Fetch => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(32),
                jitter: 1.0,
            },
            RetryPolicy::Tool => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
                jitter: 0.5,
            },
            RetryPolicy::Custom => RetryStrategyConfig::default(),
        }
    }
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    #[serde(default)]
    pub strategy: RetryStrategyType,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor. `0.0` disables jitter; `1.0` means "full jitter"
    /// (uniformly random in `[0, delay]`), matching §4.1's policy. Values in
    /// between apply `delay * (1 - jitter .. 1 + jitter)`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(32)
}

fn default_jitter() -> f64 {
    1.0
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        RetryPolicy::Fetch.to_config()
    }
}

/// Error classification for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    #[default]
    Retryable,
    Ambiguous,
    Permanent,
}

/// §4.1: classify an HTTP status code for retry eligibility. 5xx, 408, and
/// 429 are retryable; any other 4xx is fatal (permanent).
pub fn classify_http_status(status: u16) -> ErrorClass {
    match status {
        408 | 429 => ErrorClass::Retryable,
        500..=599 => ErrorClass::Retryable,
        400..=499 => ErrorClass::Permanent,
        _ => ErrorClass::Ambiguous,
    }
}

/// Calculate the delay before the next retry attempt (1-indexed).
///
/// ```
/// use cachi2_retry::{RetryStrategyConfig, RetryStrategyType, calculate_delay};
/// use std::time::Duration;
///
/// let config = RetryStrategyConfig {
///     strategy: RetryStrategyType::Exponential,
///     base_delay: Duration::from_secs(1),
///     max_delay: Duration::from_secs(60),
///     jitter: 0.0,
///     max_attempts: 10,
/// };
///
/// assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
/// assert_eq!(calculate_delay(&config, 2), Duration::from_secs(2));
/// ```
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter >= 1.0 {
        full_jitter(capped)
    } else if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// AWS-style "full jitter": uniformly random in `[0, delay]`.
fn full_jitter(delay: Duration) -> Duration {
    use rand::Rng;
    let mut rng = rand::rng();
    let factor: f64 = rng.random();
    Duration::from_millis((delay.as_millis() as f64 * factor).round() as u64)
}

/// Symmetric jitter around `delay`: `delay * (1 - jitter .. 1 + jitter)`.
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;
    let jitter_range = 2.0 * jitter;
    let mut rng = rand::rng();
    let random_value: f64 = rng.random();
    let random_factor = 1.0 - jitter + (random_value * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// Runs a fallible operation with configured retry behavior, sleeping the
/// calling thread between attempts.
pub struct RetryExecutor {
    config: RetryStrategyConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryStrategyConfig) -> Self {
        Self { config }
    }

    pub fn from_policy(policy: RetryPolicy) -> Self {
        Self::new(policy.to_config())
    }

    /// `operation` receives the current attempt number (starting at 1) and
    /// returns `Err((e, ErrorClass))` on failure. Returning a `Permanent`
    /// classification aborts immediately even if attempts remain.
    pub fn run<T, E, F>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, (E, ErrorClass)>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt) {
                Ok(result) => return Ok(result),
                Err((e, class)) => {
                    if class == ErrorClass::Permanent || attempt >= self.config.max_attempts {
                        return Err(e);
                    }
                    let delay = calculate_delay(&self.config, attempt);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
