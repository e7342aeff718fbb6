//! Minimal in-process rate limiter for platform A (spec.md §4.6 "Rate
//! limiting": "a conservative in-process cap of ~10 requests/second ...
//! is sufficient"). Platform B is governed by the quota bucket instead
//! (see `quota.rs`), not by request pacing.

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    interval: Duration,
    next_allowed: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Self {
        let per_second = per_second.max(1);
        Self {
            interval: Duration::from_secs_f64(1.0 / per_second as f64),
            next_allowed: Mutex::new(Instant::now()),
        }
    }

    /// Spaces calls at most `per_second` apart; never holds the mutex
    /// across the sleep.
    pub async fn acquire(&self) {
        let wait = {
            let mut next = self.next_allowed.lock().expect("rate limiter mutex poisoned");
            let now = Instant::now();
            let target = if *next > now { *next } else { now };
            *next = target + self.interval;
            target.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
