//! HTTP adapter: identity extraction, the limiter middleware, and the server.

mod identity;
mod middleware;
mod response;
mod server;

pub use identity::{
    request_identity, trusted_principal_headers, HEADER_FORWARDED_FOR, HEADER_TENANT_ID,
    HEADER_USER_ID, HEADER_USER_ROLES,
};
pub use middleware::{rate_limit, RateLimitState};
pub use response::{apply_rate_limit_headers, ErrorBody, RateLimited, StoreUnavailable};
pub use server::HttpServer;
