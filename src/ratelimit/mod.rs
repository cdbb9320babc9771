//! Rate limiting logic and state management.

mod backend;
mod breaker;
mod bucket;
mod decision;
mod key;
mod limiter;
mod local;
mod policy;
mod redis_store;
mod selector;
mod store;
mod window;

pub use backend::RateLimiterBackend;
pub use breaker::{BreakerStore, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use bucket::{BucketOutcome, TokenBucket};
pub use decision::{
    format_window, Decision, RateLimitHeaders, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
    HEADER_WINDOW,
};
pub use key::{KeyExtractor, KeyStrategy, Principal, RequestIdentity};
pub use limiter::{LimiterOptions, RateLimiter};
pub use local::LocalRateLimiter;
pub use policy::{PolicySpec, RateLimitPolicy, StoreErrorPolicy, WindowMode, MAX_WINDOW_SECS};
pub use redis_store::RedisCounterStore;
pub use selector::PolicySelector;
pub use store::{CounterStore, MemoryCounterStore, StoreError};
pub use window::WindowRateLimiter;
