//! HTTP server hosting the rate limited API.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::identity::trusted_principal_headers;
use super::middleware::{rate_limit, RateLimitState};
use crate::error::Result;
use crate::ratelimit::{CounterStore, PolicySelector};

/// HTTP server for the rate limited API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Policies applied to every route
    selector: Arc<PolicySelector>,
    /// Counter store reported by `/health`
    store: Option<Arc<dyn CounterStore>>,
    trust_forwarded_for: bool,
    trust_identity_headers: bool,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, selector: Arc<PolicySelector>) -> Self {
        Self {
            addr,
            selector,
            store: None,
            trust_forwarded_for: false,
            trust_identity_headers: false,
        }
    }

    /// Report the counter store's reachability from `/health`.
    pub fn with_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn trust_identity_headers(mut self, trust: bool) -> Self {
        self.trust_identity_headers = trust;
        self
    }

    /// Build the router with the limiter and tracing layers applied.
    pub fn router(&self) -> Router {
        let limit_state = RateLimitState::new(self.selector.clone())
            .trust_forwarded_for(self.trust_forwarded_for);

        let mut router = Router::new()
            .route("/health", get(health))
            .route("/api/ping", get(ping))
            .with_state(self.store.clone())
            .layer(axum::middleware::from_fn_with_state(limit_state, rate_limit));

        // Outer layers run first, so the principal is in place before the limiter.
        if self.trust_identity_headers {
            router = router.layer(axum::middleware::from_fn(trusted_principal_headers));
        }

        router.layer(TraceLayer::new_for_http())
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending::<()>()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server stops accepting connections when the provided signal
    /// resolves and returns once in-flight requests complete.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(
            addr = %self.addr,
            roles = ?self.selector.roles().collect::<Vec<_>>(),
            "Starting HTTP server"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

async fn health(
    State(store): State<Option<Arc<dyn CounterStore>>>,
) -> (StatusCode, Json<Value>) {
    let Some(store) = store else {
        return (StatusCode::OK, Json(json!({ "status": "ok" })));
    };

    match store.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok", "store": "ok" }))),
        Err(e) => {
            warn!(error = %e, "Counter store health check failed");
            (
                StatusCode::OK,
                Json(json!({ "status": "degraded", "store": "unavailable" })),
            )
        }
    }
}

async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}
