//! Token bucket shared by every worker.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::config::RateLimitConfig;

/// Token bucket shared by every worker. Refills continuously at
/// `requests_per_minute / 60` tokens per second up to `burst`.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .finish()
    }
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = f64::from(config.burst.max(1));
        Self {
            capacity,
            refill_per_sec: f64::from(config.requests_per_minute.max(1)) / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available, otherwise report how long until the
    /// next one accrues.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }

    /// Wait for a token. Returns `false` if `cancel` fired first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            match self.try_acquire() {
                Ok(()) => return true,
                Err(wait) => {
                    trace!(target: "paperwatch::client", wait_ms = wait.as_millis() as u64, "rate limited locally");
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_steady_rate() {
        let bucket = TokenBucket::new(RateLimitConfig {
            requests_per_minute: 60,
            burst: 2,
        });
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());
        let wait = bucket.try_acquire().unwrap_err();
        assert!(wait <= Duration::from_secs(1));

        let cancel = CancellationToken::new();
        let start = Instant::now();
        assert!(bucket.acquire(&cancel).await);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(990), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(1_010), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_respects_cancellation() {
        let bucket = TokenBucket::new(RateLimitConfig {
            requests_per_minute: 1,
            burst: 1,
        });
        assert!(bucket.try_acquire().is_ok());

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!bucket.acquire(&cancel).await);
    }
}
