//! Rate Limiter - token bucket used for the account send rate and the
//! management API throttle

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled continuously at `rate` tokens per second.
///
/// A rate of zero or less disables the bucket: every acquire succeeds.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Bucket with a burst equal to the rate (at least one token)
    pub fn new(rate: f64) -> Self {
        Self::with_burst(rate, rate.max(1.0))
    }

    pub fn with_burst(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate <= 0.0
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        if self.is_unlimited() {
            return true;
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Return a token taken by a call that was then refused downstream
    pub fn refund(&self) {
        if self.is_unlimited() {
            return;
        }
        let mut state = self.state.lock();
        state.tokens = (state.tokens + 1.0).min(self.burst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let bucket = TokenBucket::new(2.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_rate_has_one_token_burst() {
        let bucket = TokenBucket::new(0.5);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_restores_one_token() {
        let bucket = TokenBucket::new(1.0);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        bucket.refund();
        assert!(bucket.try_acquire());

        // Never above the burst
        tokio::time::advance(Duration::from_secs(5)).await;
        bucket.refund();
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_zero_rate_is_unlimited() {
        let bucket = TokenBucket::new(0.0);
        assert!(bucket.is_unlimited());
        for _ in 0..1000 {
            assert!(bucket.try_acquire());
        }
    }
}
