//! In-process token bucket enforcement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Instant;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::bucket::TokenBucket;
use super::decision::{retry_after_secs, Decision, RateLimitHeaders};
use super::policy::RateLimitPolicy;

/// Default cap on the number of partition keys tracked at once.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 100_000;

/// One tenth of the cap is evicted whenever the cap is reached.
const EVICTION_BATCH_DIVISOR: usize = 10;

/// Per-key token buckets for single-instance deployments.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// Contention is limited to requests sharing a partition key.
pub struct LocalRateLimiter {
    /// Token buckets indexed by partition key
    buckets: DashMap<String, TokenBucket>,
    requests_per_second: u32,
    burst_size: u32,
    max_tracked_keys: usize,
    /// Buckets dropped each time the cap is reached
    eviction_batch: usize,
    /// Held while a batch is being evicted
    evicting: Mutex<()>,
}

impl LocalRateLimiter {
    /// Create a limiter for the policy's token bucket parameters.
    pub fn new(policy: &RateLimitPolicy) -> Self {
        Self::with_capacity(policy, DEFAULT_MAX_TRACKED_KEYS)
    }

    /// Create a limiter tracking at most `max_tracked_keys` partition keys.
    pub fn with_capacity(policy: &RateLimitPolicy, max_tracked_keys: usize) -> Self {
        let max_tracked_keys = max_tracked_keys.max(1);
        Self {
            buckets: DashMap::new(),
            requests_per_second: policy.requests_per_second(),
            burst_size: policy.burst_size(),
            max_tracked_keys,
            eviction_batch: (max_tracked_keys / EVICTION_BATCH_DIVISOR).max(1),
            evicting: Mutex::new(()),
        }
    }

    /// Check the partition key at the given instants.
    ///
    /// `now` drives refill; `wall` is only used to render the reset header.
    pub fn check_at(&self, key: &str, now: Instant, wall: DateTime<Utc>) -> Decision {
        trace!(key = %key, "Checking token bucket");

        let outcome = match self.buckets.get(key) {
            Some(bucket) => bucket.try_acquire_at(now),
            None => {
                if self.buckets.len() >= self.max_tracked_keys {
                    self.evict_batch();
                }
                let bucket = self
                    .buckets
                    .entry(key.to_string())
                    .or_insert_with(|| {
                        debug!(key = %key, burst = self.burst_size, "Creating token bucket");
                        TokenBucket::new(self.burst_size, self.requests_per_second, now)
                    })
                    .downgrade();
                bucket.try_acquire_at(now)
            }
        };

        let limit = u64::from(self.requests_per_second);
        if outcome.allowed {
            return Decision::Admit(RateLimitHeaders {
                limit,
                ..Default::default()
            });
        }

        let retry_after = retry_after_secs(outcome.retry_after);
        debug!(key = %key, retry_after = retry_after, "Token bucket exhausted");
        Decision::Reject {
            headers: RateLimitHeaders {
                limit,
                remaining: Some(0),
                reset: Some(wall.timestamp() + retry_after as i64),
                window: None,
            },
            retry_after,
        }
    }

    /// Drop buckets that have refilled to capacity. Returns how many were
    /// removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_full_at(now));
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed = removed, remaining = self.buckets.len(), "Swept idle token buckets");
        }
        removed
    }

    /// Number of partition keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// Whether a bucket exists for the key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }

    /// Evict the least recently touched buckets, one batch at a time, so the
    /// scan is paid once per batch of new keys rather than on every new key.
    /// Returns how many buckets were removed.
    fn evict_batch(&self) -> usize {
        // Inserters racing an eviction in progress go ahead without waiting.
        let Some(_guard) = self.evicting.try_lock() else {
            return 0;
        };
        if self.buckets.len() < self.max_tracked_keys {
            return 0;
        }

        let mut by_age: Vec<(Instant, String)> = self
            .buckets
            .iter()
            .map(|entry| (entry.value().last_touched(), entry.key().clone()))
            .collect();
        let batch = self.eviction_batch.min(by_age.len());
        if batch == 0 {
            return 0;
        }
        if batch < by_age.len() {
            by_age.select_nth_unstable_by_key(batch - 1, |(touched, _)| *touched);
        }
        for (_, key) in &by_age[..batch] {
            self.buckets.remove(key);
        }
        debug!(evicted = batch, cap = self.max_tracked_keys, "Evicted least recently used token buckets");
        batch
    }
}

#[async_trait]
impl RateLimiterBackend for LocalRateLimiter {
    async fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now(), Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::PolicySpec;
    use std::time::Duration;

    fn limiter(rps: u32, burst: u32) -> LocalRateLimiter {
        let policy = PolicySpec {
            requests_per_second: rps,
            burst_size: burst,
            ..PolicySpec::default()
        }
        .build()
        .unwrap();
        LocalRateLimiter::new(&policy)
    }

    #[tokio::test]
    async fn test_first_request_admitted() {
        let limiter = limiter(1, 1);
        let decision = limiter.check("ip:1.2.3.4").await;
        assert_eq!(
            decision,
            Decision::Admit(RateLimitHeaders {
                limit: 1,
                ..Default::default()
            })
        );
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_burst_then_reject_then_refill() {
        let limiter = limiter(2, 3);
        let now = Instant::now();
        let wall = Utc::now();

        for _ in 0..3 {
            assert!(limiter.check_at("k", now, wall).is_admitted());
        }

        match limiter.check_at("k", now, wall) {
            Decision::Reject { headers, retry_after } => {
                assert_eq!(retry_after, 1);
                assert_eq!(headers.limit, 2);
                assert_eq!(headers.remaining, Some(0));
                assert_eq!(headers.reset, Some(wall.timestamp() + 1));
                assert_eq!(headers.window, None);
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        let later = now + Duration::from_millis(500);
        assert!(limiter.check_at("k", later, wall).is_admitted());
        assert!(!limiter.check_at("k", later, wall).is_admitted());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1, 1);
        let now = Instant::now();
        let wall = Utc::now();
        assert!(limiter.check_at("a", now, wall).is_admitted());
        assert!(!limiter.check_at("a", now, wall).is_admitted());
        assert!(limiter.check_at("b", now, wall).is_admitted());
    }

    #[test]
    fn test_sweep_drops_only_refilled_buckets() {
        let limiter = limiter(1, 2);
        let now = Instant::now();
        let wall = Utc::now();
        limiter.check_at("old", now, wall);
        limiter.check_at("fresh", now + Duration::from_millis(1500), wall);

        let removed = limiter.sweep(now + Duration::from_secs(2));
        assert_eq!(removed, 1);
        assert!(!limiter.contains_key("old"));
        assert!(limiter.contains_key("fresh"));
    }

    #[test]
    fn test_cap_evicts_least_recently_touched() {
        let policy = PolicySpec {
            requests_per_second: 1,
            burst_size: 5,
            ..PolicySpec::default()
        }
        .build()
        .unwrap();
        let limiter = LocalRateLimiter::with_capacity(&policy, 2);
        let now = Instant::now();
        let wall = Utc::now();

        limiter.check_at("first", now, wall);
        limiter.check_at("second", now + Duration::from_millis(10), wall);
        limiter.check_at("third", now + Duration::from_millis(20), wall);

        assert_eq!(limiter.tracked_keys(), 2);
        assert!(!limiter.contains_key("first"));
        assert!(limiter.contains_key("second"));
        assert!(limiter.contains_key("third"));
    }

    #[test]
    fn test_cap_evicts_a_batch_then_admits_without_scanning() {
        let policy = PolicySpec {
            requests_per_second: 1,
            burst_size: 5,
            ..PolicySpec::default()
        }
        .build()
        .unwrap();
        let limiter = LocalRateLimiter::with_capacity(&policy, 20);
        let start = Instant::now();
        let wall = Utc::now();
        let at = |i: u64| start + Duration::from_millis(i);

        for i in 0..20 {
            limiter.check_at(&format!("k{}", i), at(i), wall);
        }
        assert_eq!(limiter.tracked_keys(), 20);

        // Reaching the cap evicts one tenth of it, oldest first.
        limiter.check_at("k20", at(20), wall);
        assert_eq!(limiter.tracked_keys(), 19);
        assert!(!limiter.contains_key("k0"));
        assert!(!limiter.contains_key("k1"));
        assert!(limiter.contains_key("k2"));

        // The freed room absorbs the next new key with no eviction.
        limiter.check_at("k21", at(21), wall);
        assert_eq!(limiter.tracked_keys(), 20);
        assert!(limiter.contains_key("k2"));

        limiter.check_at("k22", at(22), wall);
        assert_eq!(limiter.tracked_keys(), 19);
        assert!(!limiter.contains_key("k2"));
        assert!(!limiter.contains_key("k3"));
        assert!(limiter.contains_key("k4"));
    }

    #[test]
    fn test_cap_does_not_sweep_inline() {
        let policy = PolicySpec {
            requests_per_second: 1,
            burst_size: 2,
            ..PolicySpec::default()
        }
        .build()
        .unwrap();
        let limiter = LocalRateLimiter::with_capacity(&policy, 10);
        let start = Instant::now();
        let wall = Utc::now();

        for i in 0..10 {
            limiter.check_at(&format!("k{}", i), start, wall);
        }

        // Every bucket has refilled by now; only one batch is dropped anyway,
        // leaving the rest to the background sweep.
        let later = start + Duration::from_secs(60);
        limiter.check_at("new", later, wall);
        assert_eq!(limiter.tracked_keys(), 10);
        assert_eq!(limiter.sweep(later), 9);
    }

    #[test]
    fn test_eviction_in_progress_is_not_repeated() {
        let limiter = limiter(1, 1);
        let _held = limiter.evicting.lock();
        assert_eq!(limiter.evict_batch(), 0);
    }
}
