//! Rate limiter trait for abstracting in-process and distributed enforcement.

use async_trait::async_trait;

use super::decision::Decision;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the in-process `LocalRateLimiter` and the
/// store-backed `WindowRateLimiter` so the HTTP layer can work with either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Count one request against the given partition key.
    async fn check(&self, key: &str) -> Decision;
}
