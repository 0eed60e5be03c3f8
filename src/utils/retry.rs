//! Retry utilities: backoff builders shared by the pipeline stages.
//!
//! Uses `backon` for exponential backoff with jitter. Each stage carries its
//! own `RetryPolicy` in configuration.

use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

/// Bounded exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub min_delay_ms: u64,
    /// Cap on any single delay.
    pub max_delay_ms: u64,
    /// Retries after the initial call (0 = call once).
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 5000,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(min_delay_ms: u64, max_delay_ms: u64, max_retries: usize) -> Self {
        Self {
            min_delay_ms,
            max_delay_ms,
            max_retries,
        }
    }

    /// Total calls made before giving up.
    pub fn max_calls(&self) -> usize {
        self.max_retries + 1
    }

    /// Backoff builder for this policy.
    ///
    /// - Exponential growth from `min_delay_ms`
    /// - Capped at `max_delay_ms`
    /// - Jitter enabled
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

/// Exponential poll delay: `base * 2^attempt`, capped at `max`.
pub fn poll_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = 1u32 << attempt.min(16);
    base.saturating_mul(factor).min(max)
}
