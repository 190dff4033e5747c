//! Capped exponential retry backoff.

use std::time::Duration;

use underwrite_core::QueueConfig;

/// `delay(n) = min(max, min * 2^n)` where `n` is the task's attempt count
/// when the retry is scheduled. After the first failed attempt `n = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    min: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.min_backoff, config.max_backoff)
    }

    pub fn delay(&self, attempt_count: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt_count).unwrap_or(u32::MAX);
        self.min.saturating_mul(factor).min(self.max)
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}
