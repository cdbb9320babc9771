//! Error responses returned by the limiter.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::ratelimit::RateLimitHeaders;

pub const CODE_RATE_LIMITED: &str = "RATE_LIMITED";
pub const CODE_SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";

/// JSON error payload.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// A request rejected for exceeding its quota.
#[derive(Debug)]
pub struct RateLimited {
    pub retry_after: u64,
}

impl IntoResponse for RateLimited {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: CODE_RATE_LIMITED,
            message: "Rate limit exceeded".to_string(),
            details: Some(json!({ "retry_after": self.retry_after })),
        };

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(self.retry_after));
        response
    }
}

/// The counter store failed and the policy rejects on store failure.
#[derive(Debug)]
pub struct StoreUnavailable;

impl IntoResponse for StoreUnavailable {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: CODE_SERVICE_UNAVAILABLE,
            message: "Rate limiting is temporarily unavailable".to_string(),
            details: None,
        };
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

/// Write the `X-RateLimit-*` headers.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, values: &RateLimitHeaders) {
    for (name, value) in values.pairs() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}
