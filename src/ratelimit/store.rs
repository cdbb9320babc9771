//! Shared counter store abstraction.
//!
//! Distributed enforcement only needs atomic increment with expiry. The
//! store is the sole arbiter of ordering for increments on one counter.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors returned by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// A network-accessible key/value counter service.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter and return the post-increment value.
    async fn increment(&self, key: &str) -> Result<u64, StoreError>;

    /// Expire the counter after `ttl`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Read a counter without modifying it.
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug)]
struct MemoryCounter {
    count: u64,
    expires_at: Option<Instant>,
}

impl MemoryCounter {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// In-memory counter store with the same expiry semantics as Redis.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, MemoryCounter>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired counters. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Number of live and not-yet-purged counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut counter = self.counters.entry(key.to_string()).or_insert(MemoryCounter {
            count: 0,
            expires_at: None,
        });
        if counter.is_expired(now) {
            counter.count = 0;
            counter.expires_at = None;
        }
        counter.count += 1;
        Ok(counter.count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(mut counter) = self.counters.get_mut(key) {
            counter.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .filter(|counter| !counter.is_expired(now))
            .map(|counter| counter.count))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
