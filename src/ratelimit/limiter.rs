//! Per-policy rate limiter.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::decision::Decision;
use super::key::RequestIdentity;
use super::local::{LocalRateLimiter, DEFAULT_MAX_TRACKED_KEYS};
use super::policy::RateLimitPolicy;
use super::store::CounterStore;
use super::window::{WindowRateLimiter, DEFAULT_STORE_TIMEOUT};
use crate::error::{Result, TurnstileError};

/// Tuning shared by every limiter built from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterOptions {
    /// Cap on partition keys tracked by each in-process limiter
    pub max_tracked_keys: usize,
    /// How often idle in-process buckets are swept, in seconds
    pub sweep_interval_secs: u64,
    /// Upper bound on a single counter store round-trip, in milliseconds
    pub store_timeout_ms: u64,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
            sweep_interval_secs: 60,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// A policy bound to its enforcement backend.
///
/// Policies with `uses_shared_store` count in the counter store; all others
/// use in-process token buckets.
#[derive(Clone)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    backend: Arc<dyn RateLimiterBackend>,
    /// Kept separately so idle buckets can be swept
    local: Option<Arc<LocalRateLimiter>>,
}

impl RateLimiter {
    /// Build a limiter with default options.
    pub fn new(policy: RateLimitPolicy, store: Option<Arc<dyn CounterStore>>) -> Result<Self> {
        Self::with_options(policy, store, &LimiterOptions::default())
    }

    /// Build a limiter. Fails when the policy needs a shared store and none
    /// was supplied.
    pub fn with_options(
        policy: RateLimitPolicy,
        store: Option<Arc<dyn CounterStore>>,
        options: &LimiterOptions,
    ) -> Result<Self> {
        if policy.uses_shared_store() {
            let store = store.ok_or_else(|| {
                TurnstileError::Config(format!(
                    "rate limit policy '{}' uses the shared store but no counter store is configured",
                    policy.name()
                ))
            })?;
            let window = WindowRateLimiter::new(&policy, store)
                .with_store_timeout(Duration::from_millis(options.store_timeout_ms.max(1)));
            debug!(
                policy = %policy.name(),
                max_requests = policy.max_requests(),
                window = ?policy.window(),
                mode = ?policy.window_mode(),
                "Built window rate limiter"
            );
            return Ok(Self {
                policy,
                backend: Arc::new(window),
                local: None,
            });
        }

        let local = Arc::new(LocalRateLimiter::with_capacity(&policy, options.max_tracked_keys));
        debug!(
            policy = %policy.name(),
            requests_per_second = policy.requests_per_second(),
            burst_size = policy.burst_size(),
            "Built token bucket rate limiter"
        );
        Ok(Self {
            policy,
            backend: local.clone(),
            local: Some(local),
        })
    }

    /// Decide whether a request for `path` from `identity` is admitted.
    pub async fn check(&self, path: &str, identity: &RequestIdentity) -> Decision {
        if self.policy.is_exempt(path) {
            trace!(path = %path, "Path exempt from rate limiting");
            return Decision::Bypass;
        }

        let key = self.policy.key().extract(identity);
        self.backend.check(&key).await
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Drop idle in-process buckets. No-op for store-backed limiters.
    pub fn sweep(&self, now: Instant) -> usize {
        self.local.as_ref().map_or(0, |local| local.sweep(now))
    }
}
