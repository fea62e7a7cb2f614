//! Token-bucket pacing for exchange requests.
//!
//! One bucket is shared by every request the pipeline issues, including
//! retries. Kept mutex-guarded so a future parallel sampler can fan out
//! workers that all serialize through the same bucket.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    updated_at: Instant,
}

pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `rate_per_sec` must be positive; capacity defaults to one second of
    /// refill.
    pub fn new(rate_per_sec: f64) -> Self {
        Self::with_capacity(rate_per_sec, rate_per_sec)
    }

    pub fn with_capacity(rate_per_sec: f64, capacity: f64) -> Self {
        assert!(rate_per_sec > 0.0, "rate_per_sec must be positive");
        assert!(capacity > 0.0, "capacity must be positive");
        Self {
            rate_per_sec,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                updated_at: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until the bucket refills if necessary.
    /// The lock is never held across the sleep.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.updated_at).as_secs_f64();
                if elapsed > 0.0 {
                    state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
                    state.updated_at = now;
                }
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                (1.0 - state.tokens) / self.rate_per_sec
            };
            if wait > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
        }
    }

    pub fn rate_per_sec(&self) -> f64 {
        self.rate_per_sec
    }
}
