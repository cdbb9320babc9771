//! Rate limit policies.
//!
//! A policy is parsed from configuration as a [`PolicySpec`] and validated
//! once into an immutable [`RateLimitPolicy`]. Invalid policies are rejected
//! here, before any request is served.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::key::{KeyExtractor, KeyStrategy};
use crate::error::{Result, TurnstileError};

/// Default counter-key namespace.
pub const DEFAULT_POLICY_NAME: &str = "ratelimit";

/// Longest window a shared-store policy may use: 366 days.
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// How distributed windows are counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// Discrete, non-overlapping windows keyed by truncated timestamp
    #[default]
    Fixed,
    /// Current window plus the previous window weighted by overlap
    Sliding,
}

/// What to do when the shared counter store cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreErrorPolicy {
    /// Admit the request without enforcement (fail-open)
    #[default]
    Admit,
    /// Refuse the request with 503
    Reject,
}

/// Serializable policy definition, as found in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySpec {
    /// Namespace used as the counter-key prefix
    pub name: String,
    /// Token refill rate for in-process enforcement
    pub requests_per_second: u32,
    /// Token bucket capacity for in-process enforcement
    pub burst_size: u32,
    /// Window length in seconds for distributed enforcement
    pub window_secs: u64,
    /// Requests allowed per window for distributed enforcement
    pub max_requests: u64,
    /// Fixed or weighted sliding window
    pub window_mode: WindowMode,
    /// Partition key strategy
    pub key: KeyStrategy,
    /// Paths exempt from limiting (exact match)
    pub skip_paths: Vec<String>,
    /// Enforce through the shared counter store instead of in-process buckets
    pub uses_shared_store: bool,
    /// Behavior when the shared counter store fails
    pub on_store_error: StoreErrorPolicy,
}

impl Default for PolicySpec {
    fn default() -> Self {
        Self {
            name: DEFAULT_POLICY_NAME.to_string(),
            requests_per_second: 10,
            burst_size: 20,
            window_secs: 60,
            max_requests: 100,
            window_mode: WindowMode::Fixed,
            key: KeyStrategy::ClientAddress,
            skip_paths: Vec::new(),
            uses_shared_store: false,
            on_store_error: StoreErrorPolicy::Admit,
        }
    }
}

impl PolicySpec {
    /// Validate the definition and build an immutable policy.
    pub fn build(&self) -> Result<RateLimitPolicy> {
        if self.name.is_empty() || self.name.contains(':') {
            return Err(invalid(&self.name, "name must be non-empty and must not contain ':'"));
        }

        if self.uses_shared_store {
            if self.max_requests == 0 {
                return Err(invalid(&self.name, "max_requests must be at least 1"));
            }
            if self.window_secs == 0 {
                return Err(invalid(&self.name, "window_secs must be at least 1"));
            }
            if self.window_secs > MAX_WINDOW_SECS {
                return Err(invalid(
                    &self.name,
                    &format!("window_secs must be at most {}", MAX_WINDOW_SECS),
                ));
            }
        } else {
            if self.requests_per_second == 0 {
                return Err(invalid(&self.name, "requests_per_second must be at least 1"));
            }
            if self.burst_size == 0 {
                return Err(invalid(&self.name, "burst_size must be at least 1"));
            }
        }

        Ok(RateLimitPolicy {
            name: self.name.clone(),
            requests_per_second: self.requests_per_second,
            burst_size: self.burst_size,
            window: Duration::from_secs(self.window_secs),
            max_requests: self.max_requests,
            window_mode: self.window_mode,
            key: self.key.into(),
            skip_paths: self.skip_paths.iter().cloned().collect(),
            uses_shared_store: self.uses_shared_store,
            on_store_error: self.on_store_error,
        })
    }

    /// Parse a single policy from YAML and validate it.
    pub fn from_yaml(yaml: &str) -> Result<RateLimitPolicy> {
        let spec: PolicySpec = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse policy: {}", e)))?;
        spec.build()
    }
}

fn invalid(name: &str, reason: &str) -> TurnstileError {
    TurnstileError::Config(format!("invalid rate limit policy '{}': {}", name, reason))
}

/// A validated, immutable rate limit policy.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    name: String,
    requests_per_second: u32,
    burst_size: u32,
    window: Duration,
    max_requests: u64,
    window_mode: WindowMode,
    key: KeyExtractor,
    skip_paths: HashSet<String>,
    uses_shared_store: bool,
    on_store_error: StoreErrorPolicy,
}

impl RateLimitPolicy {
    /// Replace the key extractor, e.g. with a caller-supplied function.
    pub fn with_key(mut self, key: KeyExtractor) -> Self {
        self.key = key;
        self
    }

    /// Counter-key namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token refill rate.
    pub fn requests_per_second(&self) -> u32 {
        self.requests_per_second
    }

    /// Token bucket capacity.
    pub fn burst_size(&self) -> u32 {
        self.burst_size
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests allowed per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Window counting mode.
    pub fn window_mode(&self) -> WindowMode {
        self.window_mode
    }

    /// Partition key extractor.
    pub fn key(&self) -> &KeyExtractor {
        &self.key
    }

    /// Whether the path bypasses limiting.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.skip_paths.contains(path)
    }

    /// Whether this policy is enforced through the shared store.
    pub fn uses_shared_store(&self) -> bool {
        self.uses_shared_store
    }

    /// Store failure behavior.
    pub fn on_store_error(&self) -> StoreErrorPolicy {
        self.on_store_error
    }
}
