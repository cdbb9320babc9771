//! Token bucket with continuous refill.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Tolerance for floating point drift in refill arithmetic.
const TOKEN_EPSILON: f64 = 1e-9;

/// Result of a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether a token was consumed
    pub allowed: bool,
    /// Whole tokens left after this attempt
    pub remaining: u64,
    /// Time until the next token is available; zero when allowed
    pub retry_after: Duration,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket: holds up to `capacity` tokens and refills at
/// `refill_per_sec` tokens per second, computed lazily on each check.
///
/// Refill and consumption happen under one lock, so concurrent callers
/// sharing a bucket can never all observe the same stale token count.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u32, refill_per_sec: u32, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(refill_per_sec),
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: now,
            }),
        }
    }

    /// Refill for the time elapsed since the last check, then try to take
    /// one token.
    pub fn try_acquire_at(&self, now: Instant) -> BucketOutcome {
        let mut state = self.state.lock();
        let tokens = self.tokens_at(&state, now);
        if now > state.last_refill {
            state.last_refill = now;
        }

        if tokens + TOKEN_EPSILON >= 1.0 {
            state.tokens = (tokens - 1.0).max(0.0);
            BucketOutcome {
                allowed: true,
                remaining: (state.tokens + TOKEN_EPSILON).floor() as u64,
                retry_after: Duration::ZERO,
            }
        } else {
            state.tokens = tokens;
            let deficit = 1.0 - tokens;
            BucketOutcome {
                allowed: false,
                remaining: 0,
                retry_after: Duration::from_secs_f64(deficit / self.refill_per_sec),
            }
        }
    }

    /// Try to take one token now.
    pub fn try_acquire(&self) -> BucketOutcome {
        self.try_acquire_at(Instant::now())
    }

    /// Whether the bucket would be at capacity at `now`. A full bucket is
    /// indistinguishable from a fresh one, so it can be dropped safely.
    pub fn is_full_at(&self, now: Instant) -> bool {
        let state = self.state.lock();
        self.tokens_at(&state, now) + TOKEN_EPSILON >= self.capacity
    }

    /// When the bucket was last checked.
    pub fn last_touched(&self) -> Instant {
        self.state.lock().last_refill
    }

    fn tokens_at(&self, state: &BucketState, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(state.last_refill);
        (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity)
    }
}
