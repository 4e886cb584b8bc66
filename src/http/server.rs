//! HTTP server fronted by the rate limiting middleware.

use axum::routing::get;
use axum::{middleware, Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tracing::{error, info};

use super::middleware::{rate_limit, RateLimitState};
use crate::error::{Result, TurnstileError};

/// HTTP server for the rate limited service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Routes, with the limiter already layered on
    router: Router,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: RateLimitState) -> Self {
        Self {
            addr,
            router: router(state),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests have finished.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| {
                error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
                TurnstileError::Io(e)
            })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}

/// Application routes. `/` sits behind the limiter; `/health` does not so
/// probes keep working for throttled addresses.
pub fn router(state: RateLimitState) -> Router {
    Router::new()
        .route("/", get(root))
        .route_layer(middleware::from_fn_with_state(state, rate_limit))
        .route("/health", get(health))
}

async fn root() -> &'static str {
    "Hello, World!"
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as TurnstileResult;
    use crate::ratelimit::{DenyReason, RateLimiterBackend, Verdict};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::{ConnectInfo, Request};
    use axum::http::{HeaderName, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct DenyAll;

    #[async_trait]
    impl RateLimiterBackend for DenyAll {
        async fn check_request(&self, _api_key: Option<&str>, _ip: &str) -> TurnstileResult<Verdict> {
            Ok(Verdict::Denied {
                reason: DenyReason::OverLimit,
                retry_after: Duration::from_secs(60),
            })
        }
    }

    struct AllowAll;

    #[async_trait]
    impl RateLimiterBackend for AllowAll {
        async fn check_request(&self, _api_key: Option<&str>, _ip: &str) -> TurnstileResult<Verdict> {
            Ok(Verdict::Allowed {
                limit: 1,
                remaining: 0,
            })
        }
    }

    fn state(backend: Arc<dyn RateLimiterBackend>) -> RateLimitState {
        RateLimitState::new(backend, HeaderName::from_static("api_key"))
    }

    fn get_request(uri: &str) -> Request {
        Request::builder()
            .uri(uri)
            .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 50_000))))
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let server = HttpServer::new(addr, state(Arc::new(AllowAll)));
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn test_root_is_served_when_allowed() {
        let response = router(state(Arc::new(AllowAll)))
            .oneshot(get_request("/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"Hello, World!");
    }

    #[tokio::test]
    async fn test_health_bypasses_limiter() {
        let app = router(state(Arc::new(DenyAll)));

        let limited = app.clone().oneshot(get_request("/")).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

        let health = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let body = axum::body::to_bytes(health.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, state(Arc::new(AllowAll)));
        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
