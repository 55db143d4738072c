//! Token-bucket throttle for a handler's delivery rate.
//!
//! Burst-friendly with sustained rate control: tokens refill continuously at
//! the configured rate and each delivery consumes one. The bucket is owned
//! by its dispatch task, so no locking is involved.

use std::time::Duration;

use tokio::time::Instant;

/// Per-handler global rate cap.
#[derive(Debug)]
pub struct Throttle {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Throttle {
    /// A bucket allowing `rate_per_sec` sustained deliveries with a burst
    /// of the same size.
    pub fn new(rate_per_sec: f64) -> Self {
        let capacity = rate_per_sec.max(1.0);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token without waiting. Returns `false` when the bucket is
    /// empty; the caller decides whether to drop or defer.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&mut self) {
        loop {
            self.refill();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let deficit = 1.0 - self.tokens;
            let wait = Duration::from_secs_f64(deficit / self.refill_per_sec);
            tokio::time::sleep(wait).await;
        }
    }
}
