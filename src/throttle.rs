//! Token-bucket throttle for per-connection publish pacing.
//!
//! IoT Core caps the publish rate per connection; the publisher loop asks a
//! connection how long it would have to wait for a token, sleeps that long
//! outside any lock, and then takes the token without blocking.

use std::time::{Duration, Instant};

/// Broker-imposed publish rate per connection, tokens per second.
pub const IOT_CORE_PUBLISH_RATE_PER_SECOND: u32 = 100;

/// A token bucket with a fixed capacity and linear refill.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_second: u32) -> Self {
        TokenBucket {
            capacity: f64::from(capacity),
            refill_per_second: f64::from(refill_per_second),
            tokens: f64::from(capacity),
            last_refill: Instant::now(),
        }
    }

    pub fn for_publishes() -> Self {
        TokenBucket::new(
            IOT_CORE_PUBLISH_RATE_PER_SECOND,
            IOT_CORE_PUBLISH_RATE_PER_SECOND,
        )
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_second)
            .min(self.capacity);
        self.last_refill = now;
    }

    /// How long until a single token could be taken without blocking.
    /// Zero when a token is already available.
    pub fn wait_time(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_second)
        }
    }

    /// Take one token. The caller is expected to have slept for
    /// `wait_time` first; the balance may go slightly negative when it has
    /// not, which self-corrects on refill.
    pub fn acquire(&mut self, now: Instant) {
        self.refill(now);
        self.tokens -= 1.0;
    }
}
