//! Circuit breaker around a counter store.
//!
//! When the store keeps failing, calls fail fast with
//! [`StoreError::CircuitOpen`] instead of waiting on a dead connection. The
//! limiter treats that like any other store failure.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::store::{CounterStore, StoreError};

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call, in seconds
    pub open_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_secs: 30,
        }
    }
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

/// A consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    open_for: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            open_for: Duration::from_secs(config.open_secs),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started: None,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `operation` through the breaker.
    ///
    /// A call dropped before it completes, for instance by a timeout wrapped
    /// around it, counts as a failure.
    pub async fn call<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        self.acquire(Instant::now())?;
        let mut pending = PendingCall {
            breaker: self,
            settled: false,
        };
        let result = operation.await;
        pending.settled = true;
        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure(Instant::now());
                Err(err)
            }
        }
    }

    fn acquire(&self, now: Instant) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                if now.saturating_duration_since(opened_at) >= self.open_for {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(now);
                    info!(breaker = %self.name, "Circuit breaker half-open, allowing trial call");
                    Ok(())
                } else {
                    Err(StoreError::CircuitOpen(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                // A trial abandoned by a cancelled request must not wedge the breaker.
                let stale = inner
                    .trial_started
                    .map_or(true, |started| now.saturating_duration_since(started) >= self.open_for);
                if stale {
                    inner.trial_started = Some(now);
                    Ok(())
                } else {
                    Err(StoreError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
    }

    fn on_failure(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_started = None;
                warn!(breaker = %self.name, "Trial call failed, circuit breaker re-opened");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// Records a failure for a call abandoned mid-flight.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(breaker = %self.breaker.name, "Counter store call abandoned before completing");
            self.breaker.on_failure(Instant::now());
        }
    }
}

/// A counter store guarded by a circuit breaker.
pub struct BreakerStore<S> {
    inner: S,
    breaker: CircuitBreaker,
}

impl<S: CounterStore> BreakerStore<S> {
    pub fn new(inner: S, config: &CircuitBreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new("counter-store", config),
        }
    }

    /// The breaker guarding this store.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl<S: CounterStore> CounterStore for BreakerStore<S> {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        self.breaker.call(self.inner.increment(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.breaker.call(self.inner.expire(key, ttl)).await
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.breaker.call(self.inner.get(key)).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.breaker.call(self.inner.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Store whose health can be toggled, counting calls that reach it.
    #[derive(Default)]
    struct FlakyStore {
        failing: AtomicBool,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn answer(&self) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn increment(&self, _key: &str) -> Result<u64, StoreError> {
            self.answer().map(|_| 1)
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
            self.answer()
        }
        async fn get(&self, _key: &str) -> Result<Option<u64>, StoreError> {
            self.answer().map(|_| None)
        }
        async fn ping(&self) -> Result<(), StoreError> {
            self.answer()
        }
    }

    fn config(open_secs: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            open_secs,
        }
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let flaky = FlakyStore::default();
        flaky.failing.store(true, Ordering::SeqCst);
        let store = BreakerStore::new(flaky, &config(60));

        assert!(matches!(store.increment("k").await, Err(StoreError::Unavailable(_))));
        assert_eq!(store.breaker().state(), CircuitState::Closed);
        assert!(matches!(store.increment("k").await, Err(StoreError::Unavailable(_))));
        assert_eq!(store.breaker().state(), CircuitState::Open);

        assert!(matches!(store.increment("k").await, Err(StoreError::CircuitOpen(_))));
        assert_eq!(store.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let store = BreakerStore::new(FlakyStore::default(), &config(60));
        store.inner.failing.store(true, Ordering::SeqCst);
        let _ = store.ping().await;
        store.inner.failing.store(false, Ordering::SeqCst);
        assert!(store.ping().await.is_ok());
        store.inner.failing.store(true, Ordering::SeqCst);
        let _ = store.ping().await;
        assert_eq!(store.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_closes_on_success() {
        let store = BreakerStore::new(FlakyStore::default(), &config(0));
        store.inner.failing.store(true, Ordering::SeqCst);
        let _ = store.ping().await;
        let _ = store.ping().await;
        assert_eq!(store.breaker().state(), CircuitState::Open);

        store.inner.failing.store(false, Ordering::SeqCst);
        assert!(store.ping().await.is_ok());
        assert_eq!(store.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let store = BreakerStore::new(FlakyStore::default(), &config(0));
        store.inner.failing.store(true, Ordering::SeqCst);
        let _ = store.ping().await;
        let _ = store.ping().await;
        let _ = store.ping().await;
        assert_eq!(store.breaker().state(), CircuitState::Open);
        assert_eq!(store.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_abandoned_trial_is_retried() {
        let breaker = CircuitBreaker::new("test", &config(5));
        let start = Instant::now();
        breaker.on_failure(start);
        breaker.on_failure(start);

        let reopen = start + Duration::from_secs(5);
        assert!(breaker.acquire(reopen).is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.acquire(reopen + Duration::from_secs(1)).is_err());
        assert!(breaker.acquire(reopen + Duration::from_secs(5)).is_ok());
    }

    /// Store that never answers.
    struct StalledStore;

    #[async_trait]
    impl CounterStore for StalledStore {
        async fn increment(&self, _key: &str) -> Result<u64, StoreError> {
            std::future::pending().await
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn get(&self, _key: &str) -> Result<Option<u64>, StoreError> {
            std::future::pending().await
        }
        async fn ping(&self) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_timed_out_calls_open_the_circuit() {
        let store = BreakerStore::new(StalledStore, &config(60));

        for _ in 0..2 {
            let result = tokio::time::timeout(Duration::from_millis(10), store.increment("k")).await;
            assert!(result.is_err());
        }
        assert_eq!(store.breaker().state(), CircuitState::Open);

        let result = tokio::time::timeout(Duration::from_millis(10), store.increment("k")).await;
        assert!(matches!(result, Ok(Err(StoreError::CircuitOpen(_)))));
    }
}
