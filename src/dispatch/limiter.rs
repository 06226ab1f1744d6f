//! Token bucket gating outbound calls from one instance client.

use std::time::Instant;

use crate::config::RateLimitConfig;

/// Fixed-rate, fixed-burst token bucket. Exhaustion is reported, never queued.
#[derive(Debug)]
pub struct TokenBucket {
    /// Available tokens, scaled by 1000 for sub-token precision.
    tokens_millis: u64,
    capacity_millis: u64,
    /// Sub-millitoken part of the last refill, credited to the next one.
    carry_millis: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// New bucket, starting full.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Instant::now())
    }

    fn with_clock(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens_millis: config.burst * 1000,
            capacity_millis: config.burst * 1000,
            carry_millis: 0.0,
            refill_rate: config.refill_per_sec,
            last_refill: now,
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;

        let earned = elapsed.as_secs_f64() * self.refill_rate * 1000.0 + self.carry_millis;
        let whole = earned.floor();
        self.tokens_millis = (self.tokens_millis + whole as u64).min(self.capacity_millis);
        self.carry_millis = if self.tokens_millis == self.capacity_millis {
            0.0
        } else {
            earned - whole
        };

        if self.tokens_millis >= 1000 {
            self.tokens_millis -= 1000;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u64 {
        self.tokens_millis / 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(burst: u64, refill_per_sec: f64) -> RateLimitConfig {
        RateLimitConfig {
            refill_per_sec,
            burst,
        }
    }

    #[test]
    fn test_burst_then_exhausted() {
        let start = Instant::now();
        let mut bucket = TokenBucket::with_clock(config(3, 1.0), start);

        assert!(bucket.try_acquire_at(start));
        assert!(bucket.try_acquire_at(start));
        assert!(bucket.try_acquire_at(start));
        assert!(!bucket.try_acquire_at(start));
    }

    #[test]
    fn test_refills_over_time() {
        let start = Instant::now();
        let mut bucket = TokenBucket::with_clock(config(1, 1.0), start);

        assert!(bucket.try_acquire_at(start));
        assert!(!bucket.try_acquire_at(start + Duration::from_millis(500)));
        assert!(bucket.try_acquire_at(start + Duration::from_millis(1001)));
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::with_clock(config(2, 10.0), start);
        bucket.try_acquire_at(start);

        bucket.try_acquire_at(start + Duration::from_secs(60));
        assert_eq!(bucket.available(), 1);
    }

    #[test]
    fn test_default_allows_hundred_call_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::with_clock(RateLimitConfig::default(), start);
        let allowed = (0..150).filter(|_| bucket.try_acquire_at(start)).count();
        assert_eq!(allowed, 100);
    }

    #[test]
    fn test_frequent_polling_keeps_configured_rate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::with_clock(config(1, 0.3), start);
        assert!(bucket.try_acquire_at(start));

        // Each 5ms poll earns 1.5 millitokens; the halves must add up.
        let refilled_at = (1..=800u32)
            .find(|i| bucket.try_acquire_at(start + Duration::from_millis(5) * *i))
            .unwrap();
        assert!((667..=668).contains(&refilled_at), "{}", refilled_at);
    }
}
