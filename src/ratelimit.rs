//! Token-bucket pacing for low-quota endpoints.
//!
//! The search API allows roughly 10 requests per minute, so pagination has to
//! be spaced out. A bucket refills continuously at the configured rate up to
//! its burst capacity; `acquire` waits for the next token instead of sleeping
//! a fixed interval, which keeps the pacer correct even when shared by
//! multiple callers.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub struct Pacer {
    state: Mutex<BucketState>,
    /// Tokens added per second
    refill_rate: f64,
    /// Maximum tokens the bucket can hold
    burst: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl Pacer {
    /// A bucket refilling at `rate_per_minute`, holding at most `burst` tokens.
    /// Starts full, so the first `burst` acquisitions are immediate.
    pub fn new(rate_per_minute: u32, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            refill_rate: rate_per_minute.max(1) as f64 / 60.0,
            burst,
        }
    }

    /// Wait until a token is available, then consume it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // Time until one full token has accumulated
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}
