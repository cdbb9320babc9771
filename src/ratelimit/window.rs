//! Distributed window enforcement over a shared counter store.
//!
//! Each (policy, partition key, window start) triple maps to one counter in
//! the store. The limiter issues a single atomic increment per request and
//! decides on the returned value; it never reads-then-writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::RateLimiterBackend;
use super::decision::{format_window, retry_after_secs, Decision, RateLimitHeaders};
use super::policy::{RateLimitPolicy, StoreErrorPolicy, WindowMode, MAX_WINDOW_SECS};
use super::store::{CounterStore, StoreError};

/// Default upper bound on a single store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// A window-counting rate limiter backed by a shared counter store.
pub struct WindowRateLimiter {
    store: Arc<dyn CounterStore>,
    name: String,
    window_secs: u64,
    max_requests: u64,
    mode: WindowMode,
    on_store_error: StoreErrorPolicy,
    store_timeout: Duration,
}

impl WindowRateLimiter {
    /// Create a limiter enforcing the policy's window parameters.
    pub fn new(policy: &RateLimitPolicy, store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            name: policy.name().to_string(),
            window_secs: policy.window().as_secs().clamp(1, MAX_WINDOW_SECS),
            max_requests: policy.max_requests(),
            mode: policy.window_mode(),
            on_store_error: policy.on_store_error(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Bound every store call by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// The counter key for a partition key and window start.
    pub fn counter_key(&self, key: &str, window_start: i64) -> String {
        format!("{}:{}:{}", self.name, key, window_start)
    }

    /// Count one request for `key` as of `now`.
    pub async fn check_at(&self, key: &str, now: DateTime<Utc>) -> Decision {
        let window_ms = self.window_ms();
        let now_ms = now.timestamp_millis();
        let window_start_ms = now_ms.div_euclid(window_ms) * window_ms;
        let window_start = window_start_ms / 1000;
        let window_end_ms = window_start_ms.saturating_add(window_ms);
        let window_end = window_end_ms / 1000;

        trace!(
            key = %key,
            window = window_start,
            mode = ?self.mode,
            "Checking window rate limit"
        );

        let elapsed_ms = now_ms - window_start_ms;
        let estimate = match self.estimate(key, window_start, elapsed_ms, window_ms).await {
            Ok(estimate) => estimate,
            Err(err) => return self.store_failed(key, err),
        };

        let used = estimate.ceil() as u64;
        let headers = RateLimitHeaders {
            limit: self.max_requests,
            remaining: Some(self.max_requests.saturating_sub(used)),
            reset: Some(window_end),
            window: Some(format_window(Duration::from_secs(self.window_secs))),
        };

        if estimate <= self.max_requests as f64 {
            return Decision::Admit(headers);
        }

        let until_reset = Duration::from_millis(window_end_ms.saturating_sub(now_ms).max(0) as u64);
        let retry_after = retry_after_secs(until_reset);
        debug!(
            key = %key,
            estimate = estimate,
            limit = self.max_requests,
            retry_after = retry_after,
            "Window rate limit exceeded"
        );
        Decision::Reject {
            headers,
            retry_after,
        }
    }

    /// Increment the current window and return the estimated request count.
    /// Fixed windows count exactly; sliding windows add the previous window
    /// weighted by how much of it still overlaps, unrounded.
    async fn estimate(
        &self,
        key: &str,
        window_start: i64,
        elapsed_ms: i64,
        window_ms: i64,
    ) -> Result<f64, StoreError> {
        let current_key = self.counter_key(key, window_start);
        let current = self.bounded(self.store.increment(&current_key)).await?;

        if current == 1 {
            if let Err(err) = self.bounded(self.store.expire(&current_key, self.ttl())).await {
                warn!(counter = %current_key, error = %err, "Failed to set counter expiry");
            }
        }

        match self.mode {
            WindowMode::Fixed => Ok(current as f64),
            WindowMode::Sliding => {
                let previous_key =
                    self.counter_key(key, window_start - self.window_secs as i64);
                let previous = self
                    .bounded(self.store.get(&previous_key))
                    .await?
                    .unwrap_or(0);
                let overlap = 1.0 - elapsed_ms as f64 / window_ms as f64;
                Ok(current as f64 + previous as f64 * overlap)
            }
        }
    }

    fn window_ms(&self) -> i64 {
        (self.window_secs * 1000) as i64
    }

    /// Sliding windows keep the previous counter readable for one more window.
    fn ttl(&self) -> Duration {
        match self.mode {
            WindowMode::Fixed => Duration::from_secs(self.window_secs),
            WindowMode::Sliding => Duration::from_secs(self.window_secs * 2),
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.store_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.store_timeout))?
    }

    fn store_failed(&self, key: &str, err: StoreError) -> Decision {
        match self.on_store_error {
            StoreErrorPolicy::Admit => {
                warn!(key = %key, error = %err, "Counter store failed, admitting without enforcement");
                Decision::Degraded
            }
            StoreErrorPolicy::Reject => {
                warn!(key = %key, error = %err, "Counter store failed, rejecting request");
                Decision::Unavailable
            }
        }
    }
}

#[async_trait]
impl RateLimiterBackend for WindowRateLimiter {
    async fn check(&self, key: &str) -> Decision {
        self.check_at(key, Utc::now()).await
    }
}
