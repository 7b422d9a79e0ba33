use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Token bucket over requests per minute. A rate of zero disables limiting.
/// Cloning shares the same bucket.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    requests_per_min: u64,
    // tokens available and the time of the last refill
    tokens: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    pub fn new(requests_per_min: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                requests_per_min,
                tokens: Mutex::new((requests_per_min as f64, Instant::now())),
            }),
        }
    }

    /// Wait for a request token.
    pub async fn acquire(&self) {
        if self.inner.requests_per_min > 0 {
            self.consume_token(self.inner.requests_per_min as f64, 60.0).await;
        }
    }

    async fn consume_token(&self, capacity: f64, period_secs: f64) {
        loop {
            let mut guard = self.inner.tokens.lock().await;
            let (ref mut tokens, ref mut last) = *guard;
            let now = Instant::now();
            let elapsed = now.duration_since(*last).as_secs_f64();
            let refill_rate = capacity / period_secs;
            *tokens = (*tokens + elapsed * refill_rate).min(capacity);
            *last = now;
            if *tokens >= 1.0 {
                *tokens -= 1.0;
                break;
            }
            let secs = (1.0 - *tokens) / refill_rate;
            drop(guard);
            tokio::time::sleep(Duration::from_secs_f64(secs.max(0.001))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_rate_never_blocks() {
        let rl = RateLimiter::new(0);
        let start = Instant::now();
        for _ in 0..100 {
            rl.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_burst_up_to_capacity_then_waits() {
        // one per second once the burst is spent
        let rl = RateLimiter::new(60);
        let start = Instant::now();
        for _ in 0..60 {
            rl.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(500));

        let before = Instant::now();
        rl.acquire().await;
        assert!(before.elapsed() >= Duration::from_millis(500));
    }
}
