//! Retry policy for idempotent WS-Management exchanges.
//!
//! Only `Identify` and WS-Transfer `Get` go through this policy. Shell
//! exchanges (Create, Command, Receive, Send, Signal, Delete) change remote
//! state and are never repeated by the library.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::WinRmError;

// ============================================================================
// Retry Policy Configuration
// ============================================================================

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Linear increase: delay * attempt.
    Linear,
    /// Exponential increase: delay * multiplier^attempt.
    Exponential,
    /// Exponential with random jitter.
    #[default]
    ExponentialWithJitter,
    /// Fibonacci sequence for gradual increase.
    Fibonacci,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 means no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay between retries.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff strategy to use.
    #[serde(default)]
    pub strategy: BackoffStrategy,

    /// Multiplier for exponential/linear backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0), used by `exponential_with_jitter`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Whether a caller-side timeout may be retried.
    #[serde(default)]
    pub retry_on_timeout: bool,
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            strategy: BackoffStrategy::default(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            retry_on_timeout: false,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set the maximum number of retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff strategy.
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the jitter factor.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Allow or forbid retrying after a caller-side timeout.
    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Linear => self
                .initial_delay
                .mul_f64(1.0 + (attempt as f64 * (self.multiplier - 1.0))),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => self
                .initial_delay
                .mul_f64(self.multiplier.powi(attempt.min(32) as i32)),
            BackoffStrategy::Fibonacci => self.initial_delay.mul_f64(fibonacci(attempt) as f64),
        };

        let capped_delay = base_delay.min(self.max_delay);

        if self.strategy == BackoffStrategy::ExponentialWithJitter && self.jitter > 0.0 {
            let jitter_range = capped_delay.as_secs_f64() * self.jitter.min(1.0);
            let jitter_value = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            Duration::from_secs_f64((capped_delay.as_secs_f64() + jitter_value).max(0.0))
        } else {
            capped_delay
        }
    }

    /// Whether `error` may be retried under this policy.
    pub fn is_retryable(&self, error: &WinRmError) -> bool {
        match error {
            WinRmError::Timeout { .. } => self.retry_on_timeout,
            other => other.is_retryable(),
        }
    }

    /// Whether another attempt is allowed after `attempt` failed ones.
    pub fn should_retry(&self, attempt: u32, error: &WinRmError) -> bool {
        attempt < self.max_retries && self.is_retryable(error)
    }
}

/// The nth Fibonacci number, capped for practical use.
fn fibonacci(n: u32) -> u64 {
    if n <= 1 {
        return 1;
    }

    let mut a = 1u64;
    let mut b = 1u64;
    for _ in 2..=n.min(50) {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    b
}
