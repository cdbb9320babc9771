//! Redis-backed counter store for multi-instance deployments.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::info;

use super::store::{CounterStore, StoreError};

/// Redis implementation of the counter store.
///
/// Counters live under `<prefix>:<key>` and expire through Redis TTLs, so the
/// store only ever holds live windows.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisCounterStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        let key_prefix = key_prefix.into();
        info!(prefix = %key_prefix, "Connected to Redis counter store");
        Ok(Self {
            connection,
            key_prefix,
        })
    }

    fn key_for(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        let count: i64 = connection.incr(self.key_for(key), 1).await?;
        u64::try_from(count)
            .map_err(|_| StoreError::Unavailable(format!("invalid counter value {}", count)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let seconds = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let _: bool = connection.expire(self.key_for(key), seconds).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut connection = self.connection.clone();
        let value: Option<u64> = connection.get(self.key_for(key)).await?;
        Ok(value)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }
}
