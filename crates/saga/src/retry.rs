//! Retry policy for step invocations and compensations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff parameters for retrying a bus invocation.
///
/// A step runs at most `max_retries + 1` times. The delay before the retry
/// that follows attempt `n` (1-indexed) is
/// `min(initial_delay * n * backoff_factor, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given parameters.
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_factor,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total number of attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after the given failed attempt (1-indexed) before the next one.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled_nanos =
            self.initial_delay.as_nanos() as f64 * f64::from(attempt) * self.backoff_factor;
        if !scaled_nanos.is_finite() || scaled_nanos <= 0.0 {
            return Duration::ZERO;
        }
        if scaled_nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(scaled_nanos.round() as u64)
    }
}
