//! Token bucket rate limiting behind the scheduler's speed token dispenser.
//!
//! Tokens are bytes. A bucket refills at a fixed rate up to its capacity;
//! callers take what they are granted and hand back whatever they did not use.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::ClockSource;
use crate::config::RateLimitConfig;

/// Rate-limiting token pool shared by every scheduled instance.
pub trait SpeedTokenDispenser: Send + Sync {
    /// Takes up to `requested` tokens and returns how many were granted.
    fn dispense(&self, requested: u64) -> u64;

    /// Gives back tokens that were dispensed but not spent.
    fn return_unused(&self, count: u64);

    /// Tokens that `dispense(requested)` would grant right now.
    fn peek(&self, requested: u64) -> u64;

    /// Brings the pool up to date with the clock.
    fn refill(&self);
}

/// Errors that can occur during token bucket operations.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DispenserError {
    /// Not enough tokens available for the requested operation
    #[error("Insufficient tokens: requested {requested}, available {available}")]
    InsufficientTokens {
        /// Number of tokens requested
        requested: u64,
        /// Number of tokens currently available
        available: u64,
    },
}

/// Token bucket driven by an external millisecond clock.
///
/// Allows bursts up to the bucket capacity while holding the average rate
/// at `refill_rate` tokens per second.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u64,
    tokens: u64,
    /// Tokens added per second
    refill_rate: u64,
    last_refill_millis: u64,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// # Panics
    ///
    /// Panics if capacity or refill_rate is zero.
    pub fn new(capacity: u64, refill_rate: u64, now_millis: u64) -> Self {
        assert!(
            capacity > 0,
            "Token bucket capacity must be greater than zero"
        );
        assert!(
            refill_rate > 0,
            "Token bucket refill rate must be greater than zero"
        );

        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill_millis: now_millis,
        }
    }

    /// Consumes exactly `tokens` or nothing.
    ///
    /// # Errors
    ///
    /// - `DispenserError::InsufficientTokens` - If requested tokens exceed available tokens
    pub fn try_consume(&mut self, tokens: u64, now_millis: u64) -> Result<(), DispenserError> {
        self.refill_at(now_millis);

        if self.tokens >= tokens {
            self.tokens -= tokens;
            Ok(())
        } else {
            Err(DispenserError::InsufficientTokens {
                requested: tokens,
                available: self.tokens,
            })
        }
    }

    /// Consumes up to `requested` tokens, returning the amount taken.
    pub fn consume(&mut self, requested: u64, now_millis: u64) -> u64 {
        self.refill_at(now_millis);

        let consumed = requested.min(self.tokens);
        self.tokens -= consumed;
        consumed
    }

    /// Returns unused tokens, never exceeding capacity.
    pub fn give_back(&mut self, tokens: u64) {
        self.tokens = self.tokens.saturating_add(tokens).min(self.capacity);
    }

    pub fn available_tokens(&mut self, now_millis: u64) -> u64 {
        self.refill_at(now_millis);
        self.tokens
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> u64 {
        self.refill_rate
    }

    /// Adds the tokens earned since the last refill.
    ///
    /// Only whole tokens are credited; the refill timestamp advances by the
    /// time those tokens cover so fractions carry over.
    pub fn refill_at(&mut self, now_millis: u64) {
        let elapsed = now_millis.saturating_sub(self.last_refill_millis);
        if elapsed == 0 {
            return;
        }

        let earned = u128::from(elapsed) * u128::from(self.refill_rate) / 1000;
        if earned == 0 {
            return;
        }

        if self.tokens >= self.capacity {
            self.last_refill_millis = now_millis;
            return;
        }

        let earned = u64::try_from(earned).unwrap_or(u64::MAX);
        self.tokens = self.tokens.saturating_add(earned).min(self.capacity);
        let covered = u128::from(earned) * 1000 / u128::from(self.refill_rate);
        let covered = u64::try_from(covered).unwrap_or(elapsed).min(elapsed);
        self.last_refill_millis += covered;
    }
}

enum Limit {
    Unlimited,
    Limited {
        bucket: Mutex<TokenBucket>,
        clock: Arc<dyn ClockSource>,
    },
}

/// [`SpeedTokenDispenser`] over a single shared token bucket.
pub struct TokenBucketDispenser {
    limit: Limit,
}

impl TokenBucketDispenser {
    /// Dispenser that grants every request in full.
    pub fn unlimited() -> Self {
        Self {
            limit: Limit::Unlimited,
        }
    }

    /// Dispenser limited to `rate` tokens per second with a burst of
    /// `rate * burst_multiplier` tokens.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is zero.
    pub fn limited(rate: u64, burst_multiplier: f64, clock: Arc<dyn ClockSource>) -> Self {
        let capacity = ((rate as f64) * burst_multiplier.max(1.0)) as u64;
        let bucket = TokenBucket::new(capacity.max(1), rate, clock.monotonic_millis());
        Self {
            limit: Limit::Limited {
                bucket: Mutex::new(bucket),
                clock,
            },
        }
    }

    /// Builds the dispenser described by `config`.
    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn ClockSource>) -> Self {
        match config.download_limit {
            Some(rate) if rate > 0 => Self::limited(rate, config.burst_multiplier, clock),
            _ => Self::unlimited(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self.limit, Limit::Unlimited)
    }

    /// Bucket capacity, or `None` when unlimited.
    pub fn capacity(&self) -> Option<u64> {
        match &self.limit {
            Limit::Unlimited => None,
            Limit::Limited { bucket, .. } => Some(bucket.lock().capacity()),
        }
    }

    /// Takes exactly `requested` tokens or none.
    ///
    /// # Errors
    ///
    /// - `DispenserError::InsufficientTokens` - If the bucket holds fewer tokens than requested
    pub fn try_dispense(&self, requested: u64) -> Result<(), DispenserError> {
        match &self.limit {
            Limit::Unlimited => Ok(()),
            Limit::Limited { bucket, clock } => {
                bucket.lock().try_consume(requested, clock.monotonic_millis())
            }
        }
    }
}

impl SpeedTokenDispenser for TokenBucketDispenser {
    fn dispense(&self, requested: u64) -> u64 {
        match &self.limit {
            Limit::Unlimited => requested,
            Limit::Limited { bucket, clock } => {
                bucket.lock().consume(requested, clock.monotonic_millis())
            }
        }
    }

    fn return_unused(&self, count: u64) {
        if let Limit::Limited { bucket, .. } = &self.limit {
            bucket.lock().give_back(count);
        }
    }

    fn peek(&self, requested: u64) -> u64 {
        match &self.limit {
            Limit::Unlimited => requested,
            Limit::Limited { bucket, clock } => bucket
                .lock()
                .available_tokens(clock.monotonic_millis())
                .min(requested),
        }
    }

    fn refill(&self) {
        if let Limit::Limited { bucket, clock } = &self.limit {
            bucket.lock().refill_at(clock.monotonic_millis());
        }
    }
}

impl std::fmt::Debug for TokenBucketDispenser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.limit {
            Limit::Unlimited => f.write_str("TokenBucketDispenser(unlimited)"),
            Limit::Limited { bucket, .. } => f
                .debug_tuple("TokenBucketDispenser")
                .field(&*bucket.lock())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_token_bucket_creation() {
        let bucket = TokenBucket::new(100, 10, 0);
        assert_eq!(bucket.capacity(), 100);
        assert_eq!(bucket.refill_rate(), 10);
    }

    #[test]
    #[should_panic(expected = "Token bucket capacity must be greater than zero")]
    fn test_zero_capacity_panics() {
        TokenBucket::new(0, 10, 0);
    }

    #[test]
    #[should_panic(expected = "Token bucket refill rate must be greater than zero")]
    fn test_zero_refill_rate_panics() {
        TokenBucket::new(100, 0, 0);
    }

    #[test]
    fn test_consume_partial() {
        let mut bucket = TokenBucket::new(100, 10, 0);

        assert_eq!(bucket.consume(90, 0), 90);
        assert_eq!(bucket.consume(50, 0), 10);
        assert_eq!(bucket.available_tokens(0), 0);
    }

    #[test]
    fn test_try_consume_insufficient_tokens() {
        let mut bucket = TokenBucket::new(100, 10, 0);
        assert!(bucket.try_consume(90, 0).is_ok());

        let result = bucket.try_consume(50, 0);

        assert_eq!(
            result,
            Err(DispenserError::InsufficientTokens {
                requested: 50,
                available: 10,
            })
        );
    }

    #[test]
    fn test_refill_by_elapsed_time() {
        let mut bucket = TokenBucket::new(1000, 100, 0);
        bucket.consume(1000, 0);

        assert_eq!(bucket.available_tokens(100), 10);
        assert_eq!(bucket.available_tokens(1_000), 100);
    }

    #[test]
    fn test_fractional_refill_carries_over() {
        let mut bucket = TokenBucket::new(100, 3, 0);
        bucket.consume(100, 0);

        // 3 tokens/s: one token per 333.3ms.
        assert_eq!(bucket.available_tokens(300), 0);
        assert_eq!(bucket.available_tokens(400), 1);
        assert_eq!(bucket.available_tokens(700), 2);
        assert_eq!(bucket.available_tokens(1_000), 3);
    }

    #[test]
    fn test_give_back_is_capped() {
        let mut bucket = TokenBucket::new(50, 10, 0);
        bucket.consume(20, 0);

        bucket.give_back(100);

        assert_eq!(bucket.available_tokens(0), 50);
    }

    #[test]
    fn test_unlimited_dispenser_grants_everything() {
        let dispenser = TokenBucketDispenser::unlimited();

        assert!(dispenser.is_unlimited());
        assert_eq!(dispenser.capacity(), None);
        assert_eq!(dispenser.dispense(u64::MAX), u64::MAX);
        assert_eq!(dispenser.peek(4096), 4096);
        assert!(dispenser.try_dispense(1 << 40).is_ok());
    }

    #[test]
    fn test_limited_dispenser_follows_clock() {
        let clock = ManualClock::new(5_000);
        let dispenser = TokenBucketDispenser::limited(1_000, 2.0, clock.clone());
        assert_eq!(dispenser.capacity(), Some(2_000));

        assert_eq!(dispenser.dispense(5_000), 2_000);
        assert_eq!(dispenser.peek(10), 0);

        clock.advance(Duration::from_millis(250));
        dispenser.refill();
        assert_eq!(dispenser.peek(1_000), 250);

        dispenser.return_unused(100);
        assert_eq!(dispenser.dispense(1_000), 350);
    }

    #[test]
    fn test_from_config_zero_limit_is_unlimited() {
        let clock = ManualClock::new(0);
        let config = RateLimitConfig {
            download_limit: Some(0),
            ..RateLimitConfig::default()
        };

        let dispenser = TokenBucketDispenser::from_config(&config, clock);

        assert!(dispenser.is_unlimited());
    }

    proptest! {
        #[test]
        fn test_tokens_never_exceed_capacity(
            capacity in 1u64..10_000,
            rate in 1u64..100_000,
            steps in proptest::collection::vec((0u64..5_000, 0u64..20_000), 1..40),
        ) {
            let mut bucket = TokenBucket::new(capacity, rate, 0);
            let mut now = 0;
            for (advance, take) in steps {
                now += advance;
                let taken = bucket.consume(take, now);
                prop_assert!(taken <= take);
                prop_assert!(bucket.available_tokens(now) <= capacity);
            }
        }
    }
}
