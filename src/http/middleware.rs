//! Rate limiting middleware for axum routers.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::debug;

use super::identity::request_identity;
use super::response::{apply_rate_limit_headers, RateLimited, StoreUnavailable};
use crate::ratelimit::{Decision, PolicySelector};

/// State shared by every invocation of [`rate_limit`].
#[derive(Clone)]
pub struct RateLimitState {
    pub selector: Arc<PolicySelector>,
    pub trust_forwarded_for: bool,
}

impl RateLimitState {
    pub fn new(selector: Arc<PolicySelector>) -> Self {
        Self {
            selector,
            trust_forwarded_for: false,
        }
    }

    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

/// Admit or reject a request under the policy selected for its caller.
///
/// Mount with `axum::middleware::from_fn_with_state`. Admitted responses carry
/// the `X-RateLimit-*` headers; rejections never reach the handler.
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let identity = request_identity(&request, state.trust_forwarded_for);
    let limiter = state.selector.select(&identity);

    match limiter.check(request.uri().path(), &identity).await {
        Decision::Bypass | Decision::Degraded => next.run(request).await,
        Decision::Admit(headers) => {
            let mut response = next.run(request).await;
            apply_rate_limit_headers(response.headers_mut(), &headers);
            response
        }
        Decision::Reject {
            headers,
            retry_after,
        } => {
            debug!(
                policy = %limiter.policy().name(),
                path = %request.uri().path(),
                client = %identity.client_addr,
                retry_after,
                "Request rate limited"
            );
            let mut response = RateLimited { retry_after }.into_response();
            apply_rate_limit_headers(response.headers_mut(), &headers);
            response
        }
        Decision::Unavailable => StoreUnavailable.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::ratelimit::{
        CounterStore, MemoryCounterStore, Principal, PolicySpec, RateLimiter, StoreError,
        StoreErrorPolicy, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_WINDOW,
    };

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment(&self, _key: &str) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn get(&self, _key: &str) -> Result<Option<u64>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn window_spec(max_requests: u64) -> PolicySpec {
        PolicySpec {
            max_requests,
            window_secs: 60,
            uses_shared_store: true,
            skip_paths: vec!["/health".to_string()],
            ..PolicySpec::default()
        }
    }

    fn app(selector: PolicySelector) -> Router {
        let state = RateLimitState::new(Arc::new(selector));
        Router::new()
            .route("/api", get(|| async { "ok" }))
            .route("/health", get(|| async { "healthy" }))
            .layer(axum::middleware::from_fn_with_state(state, rate_limit))
    }

    fn window_app(max_requests: u64, store: Arc<dyn CounterStore>) -> Router {
        let limiter =
            RateLimiter::new(window_spec(max_requests).build().unwrap(), Some(store)).unwrap();
        app(PolicySelector::single(limiter))
    }

    fn request(path: &str, peer: &str) -> Request {
        let addr: SocketAddr = peer.parse().unwrap();
        Request::builder()
            .uri(path)
            .extension(ConnectInfo(addr))
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_window_limit_and_headers() {
        let app = window_app(3, Arc::new(MemoryCounterStore::new()));

        for expected_remaining in ["2", "1", "0"] {
            let response = app.clone().oneshot(request("/api", "10.0.0.1:4000")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[HEADER_LIMIT], "3");
            assert_eq!(response.headers()[HEADER_REMAINING], expected_remaining);
            assert_eq!(response.headers()[HEADER_WINDOW], "1m0s");
            assert!(response.headers().contains_key(HEADER_RESET));
        }

        let response = app.clone().oneshot(request("/api", "10.0.0.1:4001")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[HEADER_REMAINING], "0");
        let body = json_body(response).await;
        assert_eq!(body["code"], "RATE_LIMITED");
        assert_eq!(body["message"], "Rate limit exceeded");
        let retry_after = body["details"]["retry_after"].as_u64().unwrap();
        assert!((1..=60).contains(&retry_after));

        // A different client has its own quota.
        let response = app.oneshot(request("/api", "10.0.0.2:4000")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_exempt_path_has_no_headers() {
        let store = Arc::new(MemoryCounterStore::new());
        let app = window_app(1, store.clone());

        for _ in 0..3 {
            let response = app.clone().oneshot(request("/health", "10.0.0.1:4000")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key(HEADER_LIMIT));
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_admits_without_headers() {
        let app = window_app(1, Arc::new(DownStore));

        for _ in 0..3 {
            let response = app.clone().oneshot(request("/api", "10.0.0.1:4000")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key(HEADER_LIMIT));
        }
    }

    #[tokio::test]
    async fn test_store_failure_rejects_when_configured() {
        let spec = PolicySpec {
            on_store_error: StoreErrorPolicy::Reject,
            ..window_spec(1)
        };
        let limiter = RateLimiter::new(spec.build().unwrap(), Some(Arc::new(DownStore))).unwrap();
        let app = app(PolicySelector::single(limiter));

        let response = app.oneshot(request("/api", "10.0.0.1:4000")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["code"], "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_token_bucket_reports_rate_only_on_admit() {
        let spec = PolicySpec {
            requests_per_second: 1,
            burst_size: 2,
            ..PolicySpec::default()
        };
        let limiter = RateLimiter::new(spec.build().unwrap(), None).unwrap();
        let app = app(PolicySelector::single(limiter));

        for _ in 0..2 {
            let response = app.clone().oneshot(request("/api", "10.0.0.1:4000")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[HEADER_LIMIT], "1");
            assert!(!response.headers().contains_key(HEADER_REMAINING));
        }

        let response = app.oneshot(request("/api", "10.0.0.1:4000")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[HEADER_REMAINING], "0");
        assert_eq!(json_body(response).await["details"]["retry_after"], 1);
    }

    #[tokio::test]
    async fn test_role_policy_selected_from_principal() {
        let tight = RateLimiter::new(
            PolicySpec {
                name: "default".to_string(),
                requests_per_second: 1,
                burst_size: 1,
                ..PolicySpec::default()
            }
            .build()
            .unwrap(),
            None,
        )
        .unwrap();
        let generous = RateLimiter::new(
            PolicySpec {
                name: "admin".to_string(),
                requests_per_second: 100,
                burst_size: 100,
                ..PolicySpec::default()
            }
            .build()
            .unwrap(),
            None,
        )
        .unwrap();
        let app = app(PolicySelector::new(vec![("admin".to_string(), generous)], tight));

        let admin = || {
            let mut request = request("/api", "10.0.0.9:4000");
            request.extensions_mut().insert(Principal {
                user_id: Some("root".to_string()),
                tenant_id: None,
                roles: vec!["admin".to_string()],
            });
            request
        };

        for _ in 0..5 {
            let response = app.clone().oneshot(admin()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[HEADER_LIMIT], "100");
        }

        let response = app.clone().oneshot(request("/api", "10.0.0.8:4000")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(request("/api", "10.0.0.8:4000")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
