//! Partition key extraction.
//!
//! A partition key is the identity a quota is tracked against. Extraction
//! never fails: a request without a principal or tenant degrades to its
//! network address.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Placeholder used when the client address could not be determined.
const UNKNOWN_ADDR: &str = "unknown";

/// An authenticated caller, inserted into request extensions by the
/// authentication layer that runs ahead of the limiter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    /// Authenticated user identifier
    pub user_id: Option<String>,
    /// Tenant the user is acting within
    pub tenant_id: Option<String>,
    /// Roles granted to the user
    pub roles: Vec<String>,
}

/// The observable attributes of a request that key extraction may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Caller network address
    pub client_addr: String,
    /// Authenticated principal, if any
    pub principal: Option<Principal>,
}

impl RequestIdentity {
    /// Identity for an unauthenticated caller.
    pub fn anonymous(client_addr: impl Into<String>) -> Self {
        Self {
            client_addr: client_addr.into(),
            principal: None,
        }
    }

    /// Identity for an authenticated caller.
    pub fn authenticated(client_addr: impl Into<String>, principal: Principal) -> Self {
        Self {
            client_addr: client_addr.into(),
            principal: Some(principal),
        }
    }

    /// Roles held by the caller, empty when unauthenticated.
    pub fn roles(&self) -> &[String] {
        self.principal
            .as_ref()
            .map(|p| p.roles.as_slice())
            .unwrap_or(&[])
    }

    fn user_id(&self) -> Option<&str> {
        self.principal
            .as_ref()
            .and_then(|p| p.user_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    fn tenant_id(&self) -> Option<&str> {
        self.principal
            .as_ref()
            .and_then(|p| p.tenant_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    fn address_key(&self) -> String {
        let addr = if self.client_addr.is_empty() {
            UNKNOWN_ADDR
        } else {
            self.client_addr.as_str()
        };
        format!("ip:{}", addr)
    }
}

/// Built-in key extraction strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Partition by caller network address
    #[default]
    ClientAddress,
    /// Partition by authenticated user, falling back to address
    User,
    /// Partition by tenant, falling back to address
    Tenant,
}

impl KeyStrategy {
    /// Derive the partition key for a request.
    pub fn extract(&self, identity: &RequestIdentity) -> String {
        match self {
            KeyStrategy::ClientAddress => identity.address_key(),
            KeyStrategy::User => match identity.user_id() {
                Some(id) => format!("user:{}", id),
                None => identity.address_key(),
            },
            KeyStrategy::Tenant => match identity.tenant_id() {
                Some(id) => format!("tenant:{}", id),
                None => identity.address_key(),
            },
        }
    }
}

type KeyFn = dyn Fn(&RequestIdentity) -> String + Send + Sync;

/// A cloneable key extraction function.
#[derive(Clone)]
pub struct KeyExtractor {
    func: Arc<KeyFn>,
    label: &'static str,
}

impl KeyExtractor {
    /// Wrap a caller-supplied function. It must be deterministic for the
    /// duration of one request and must not panic.
    pub fn custom<F>(func: F) -> Self
    where
        F: Fn(&RequestIdentity) -> String + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            label: "custom",
        }
    }

    /// Derive the partition key for a request.
    pub fn extract(&self, identity: &RequestIdentity) -> String {
        (self.func)(identity)
    }
}

impl From<KeyStrategy> for KeyExtractor {
    fn from(strategy: KeyStrategy) -> Self {
        let label = match strategy {
            KeyStrategy::ClientAddress => "client_address",
            KeyStrategy::User => "user",
            KeyStrategy::Tenant => "tenant",
        };
        Self {
            func: Arc::new(move |identity| strategy.extract(identity)),
            label,
        }
    }
}

impl Default for KeyExtractor {
    fn default() -> Self {
        KeyStrategy::default().into()
    }
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyExtractor").field(&self.label).finish()
    }
}
