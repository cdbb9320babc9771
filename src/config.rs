//! Configuration management for Turnstile.
//!
//! Configuration is read from an optional YAML file and then overridden by
//! environment variables prefixed with `TURNSTILE__`, using `__` between
//! nested keys (for example `TURNSTILE__SERVER__HTTP_ADDR=0.0.0.0:8080`).

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    CircuitBreakerConfig, CounterStore, LimiterOptions, PolicySelector, PolicySpec, RateLimiter,
};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter tuning
    #[serde(default)]
    pub limiter: LimiterOptions,

    /// Rate limit policies
    #[serde(default)]
    pub policies: PoliciesConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Use the first `X-Forwarded-For` hop as the client address
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Build the principal from gateway-supplied identity headers
    #[serde(default)]
    pub trust_identity_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_forwarded_for: false,
            trust_identity_headers: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8080))
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Pretty,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Counter store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters; only correct for a single instance
    #[default]
    Memory,
    /// Redis shared by every instance
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix prepended to every counter key in Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "turnstile".to_string()
}

/// A policy applied to callers holding `role`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolePolicy {
    pub role: String,
    pub policy: PolicySpec,
}

/// Rate limit policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoliciesConfig {
    /// Policy for callers matching no role
    #[serde(default)]
    pub default: PolicySpec,

    /// Role policies, highest precedence first
    #[serde(default)]
    pub roles: Vec<RolePolicy>,
}

impl PoliciesConfig {
    /// Validate every policy and build the selector. Any invalid policy, or
    /// a shared-store policy without a store, fails here.
    pub fn build_selector(
        &self,
        store: Option<Arc<dyn CounterStore>>,
        options: &LimiterOptions,
    ) -> Result<PolicySelector> {
        let default = RateLimiter::with_options(self.default.build()?, store.clone(), options)?;

        let mut precedence = Vec::with_capacity(self.roles.len());
        for entry in &self.roles {
            if precedence.iter().any(|(role, _)| role == &entry.role) {
                return Err(TurnstileError::Config(format!(
                    "role '{}' has more than one rate limit policy",
                    entry.role
                )));
            }
            let limiter = RateLimiter::with_options(entry.policy.build()?, store.clone(), options)?;
            precedence.push((entry.role.clone(), limiter));
        }

        Ok(PolicySelector::new(precedence, default))
    }

    /// Whether any policy counts in the shared store.
    pub fn uses_shared_store(&self) -> bool {
        self.default.uses_shared_store || self.roles.iter().any(|r| r.policy.uses_shared_store)
    }
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
