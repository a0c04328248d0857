//! Retry backoff

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `base * 2^retry_count`, capped at `max`, plus jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    /// Create a policy; `jitter` is clamped to `0.0..=1.0`
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Policy without jitter, handy for deterministic schedules
    pub fn fixed_curve(base_delay: Duration, max_delay: Duration) -> Self {
        Self::new(base_delay, max_delay, 0.0)
    }

    /// Delay before the retry following `retry_count` earlier retries, without jitter
    pub fn base_backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next attempt, jittered upward by at most `jitter` of the delay
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let delay = self.base_backoff(retry_count);
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = delay.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter));
        (delay + extra).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(600), 0.2)
    }
}
