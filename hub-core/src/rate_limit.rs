//! Per-connection token bucket rate limiter.
//!
//! Non-blocking by design: a denied request fails immediately with
//! `ERR_RATE_LIMIT` rather than waiting for tokens to refill, since a
//! frame-processing task must never stall holding a connection's slot.

use std::time::Instant;

/// A token bucket with a sustained refill rate and a burst ceiling.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    #[must_use]
    pub fn new(refill_per_sec: u32, burst: u32) -> Self {
        Self {
            capacity: f64::from(burst),
            tokens: f64::from(burst),
            refill_per_sec: f64::from(refill_per_sec),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Attempts to take one token. Returns `true` if allowed.
    pub fn try_take(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
