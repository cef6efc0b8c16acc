//! Delay schedule between service attempts.

use std::time::Duration;

use rand::Rng;

use super::config::RetryConfig;

/// Exponential backoff with a symmetric jitter band around each step.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    config: RetryConfig,
}

impl BackoffPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u16 {
        self.config.max_retries.max(1)
    }

    /// Un-jittered delay to wait after failed attempt number `attempt`
    /// (1-based): `base * 2^(attempt-1)`, capped at `backoff_max`.
    pub fn anchor_delay_ms(&self, attempt: u16) -> u64 {
        if attempt == 0 || self.config.backoff_base_ms == 0 {
            return 0;
        }
        let exp = i32::from(attempt.saturating_sub(1)).min(32);
        let scaled = (self.config.backoff_base_ms as f64) * 2f64.powi(exp);
        scaled.min(self.config.backoff_max_ms as f64).max(0.0) as u64
    }

    /// Jittered delay drawn uniformly from `anchor ± max(anchor * ratio, jitter_min)`,
    /// clamped to `[0, backoff_max]`.
    pub fn delay_for(&self, attempt: u16, rng: &mut impl Rng) -> Duration {
        let anchor = self.anchor_delay_ms(attempt);
        if anchor == 0 {
            return Duration::ZERO;
        }

        let max = self.config.backoff_max_ms as f64;
        let ratio = f64::from(self.config.jitter_ratio.max(0.0));
        let span = (anchor as f64 * ratio)
            .max(self.config.jitter_min_ms as f64)
            .min(max);

        let lower = (anchor as f64 - span).max(0.0);
        let upper = (anchor as f64 + span).min(max);
        if upper <= lower {
            return Duration::from_millis(lower.round() as u64);
        }
        let jittered = rng.random_range(lower..=upper);
        Duration::from_millis(jittered.round() as u64)
    }
}
