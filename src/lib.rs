//! Turnstile - Request Admission Limiter
//!
//! This crate decides, per incoming HTTP request, whether the request is
//! admitted under a configured quota. Quotas are enforced either with
//! in-process token buckets or with fixed/sliding window counters kept in a
//! shared store (Redis) so that every instance sees the same counts.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
