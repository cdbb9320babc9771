//! Per-principal policy selection.
//!
//! Roles are matched against an explicit precedence list owned by the
//! configuration. The order in which a caller's roles happen to arrive never
//! affects which policy applies.

use std::time::Instant;

use super::key::RequestIdentity;
use super::limiter::RateLimiter;

/// Chooses the limiter for a request from the caller's roles.
#[derive(Clone)]
pub struct PolicySelector {
    /// Role-specific limiters, highest precedence first
    precedence: Vec<(String, RateLimiter)>,
    /// Limiter for callers matching no role
    default: RateLimiter,
}

impl PolicySelector {
    /// A selector that applies one limiter to everyone.
    pub fn single(limiter: RateLimiter) -> Self {
        Self {
            precedence: Vec::new(),
            default: limiter,
        }
    }

    /// A selector with role-specific limiters in precedence order.
    pub fn new(precedence: Vec<(String, RateLimiter)>, default: RateLimiter) -> Self {
        Self {
            precedence,
            default,
        }
    }

    /// The limiter for the first precedence entry whose role the caller
    /// holds, or the default.
    pub fn select(&self, identity: &RequestIdentity) -> &RateLimiter {
        let roles = identity.roles();
        self.precedence
            .iter()
            .find(|(role, _)| roles.iter().any(|held| held == role))
            .map(|(_, limiter)| limiter)
            .unwrap_or(&self.default)
    }

    /// Roles in precedence order.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.precedence.iter().map(|(role, _)| role.as_str())
    }

    /// Sweep idle in-process state across every limiter.
    pub fn sweep(&self, now: Instant) -> usize {
        self.precedence
            .iter()
            .map(|(_, limiter)| limiter.sweep(now))
            .sum::<usize>()
            + self.default.sweep(now)
    }
}
