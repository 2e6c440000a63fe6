//! Token-bucket rate limiting for upstream polling.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// A token bucket with an adjustable refill rate.
///
/// `wait` consumes one token, sleeping until one is available. `set_rate`
/// takes effect immediately for tokens not yet accrued.
pub struct RateLimiter {
    inner: Mutex<Bucket>,
}

struct Bucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        self.refilled_at = now;
    }
}

impl RateLimiter {
    /// `rate` is tokens per second; `burst` is the bucket capacity. The
    /// bucket starts full.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            inner: Mutex::new(Bucket {
                rate,
                burst,
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().expect("rate limiter poisoned").rate
    }

    pub fn set_rate(&self, rate: f64) {
        let mut bucket = self.inner.lock().expect("rate limiter poisoned");
        // Settle accrued tokens at the old rate before switching.
        bucket.refill(Instant::now());
        bucket.rate = rate;
    }

    /// Consumes one token, sleeping for the shortfall if the bucket is empty.
    pub async fn wait(&self) {
        let delay = {
            let mut bucket = self.inner.lock().expect("rate limiter poisoned");
            bucket.refill(Instant::now());
            bucket.tokens -= 1.0;
            if bucket.tokens >= 0.0 {
                None
            } else {
                Some(Duration::from_secs_f64(-bucket.tokens / bucket.rate))
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_not_throttled() {
        let limiter = RateLimiter::new(1.0, 4);
        let started = Instant::now();
        for _ in 0..4 {
            limiter.wait().await;
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn drained_bucket_waits_for_refill() {
        let limiter = RateLimiter::new(2.0, 1);
        limiter.wait().await;
        let started = Instant::now();
        limiter.wait().await;
        // One token at 2/s accrues in half a second.
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_change_applies_to_future_tokens() {
        let limiter = RateLimiter::new(1000.0, 1);
        limiter.wait().await;
        limiter.set_rate(0.5);
        assert_eq!(limiter.rate(), 0.5);

        let started = Instant::now();
        limiter.wait().await;
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
