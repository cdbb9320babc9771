//! Request identity extraction.

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;

use crate::ratelimit::{Principal, RequestIdentity};

/// Proxy chain header; the first hop is the original client.
pub const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";
/// Gateway-supplied user identifier.
pub const HEADER_USER_ID: &str = "x-user-id";
/// Gateway-supplied tenant identifier.
pub const HEADER_TENANT_ID: &str = "x-tenant-id";
/// Gateway-supplied roles, comma separated.
pub const HEADER_USER_ROLES: &str = "x-user-roles";

/// Build the identity the limiter partitions on.
///
/// The client address is the peer address of the connection, or the first
/// `X-Forwarded-For` hop when `trust_forwarded_for` is set. The principal is
/// whatever the authentication layer stored in the request extensions.
pub fn request_identity(request: &Request, trust_forwarded_for: bool) -> RequestIdentity {
    let forwarded = if trust_forwarded_for {
        forwarded_client(request.headers())
    } else {
        None
    };

    let client_addr = forwarded
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_default();

    RequestIdentity {
        client_addr,
        principal: request.extensions().get::<Principal>().cloned(),
    }
}

fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HEADER_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(str::to_owned)
}

/// Read the principal from headers set by an authenticating gateway.
///
/// Only mount this when every request passes through such a gateway; the
/// headers are otherwise caller controlled. An existing `Principal`
/// extension is left untouched.
pub async fn trusted_principal_headers(mut request: Request, next: Next) -> Response {
    if request.extensions().get::<Principal>().is_none() {
        if let Some(principal) = principal_from_headers(request.headers()) {
            request.extensions_mut().insert(principal);
        }
    }
    next.run(request).await
}

fn principal_from_headers(headers: &HeaderMap) -> Option<Principal> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    };

    let user_id = header(HEADER_USER_ID);
    let tenant_id = header(HEADER_TENANT_ID);
    let roles: Vec<String> = header(HEADER_USER_ROLES)
        .map(|roles| {
            roles
                .split(',')
                .map(str::trim)
                .filter(|role| !role.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    if user_id.is_none() && tenant_id.is_none() && roles.is_empty() {
        return None;
    }

    Some(Principal {
        user_id,
        tenant_id,
        roles,
    })
}
