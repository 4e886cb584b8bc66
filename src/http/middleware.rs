//! Admission-control middleware for axum routers.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument};

use crate::ratelimit::{RateLimiterBackend, Verdict};

/// Body of every 429 response.
pub const RATE_LIMITED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Address reported when the connection carries no peer information.
const UNKNOWN_CLIENT: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Shared state for [`rate_limit`].
#[derive(Clone)]
pub struct RateLimitState {
    backend: Arc<dyn RateLimiterBackend>,
    api_key_header: HeaderName,
    trust_forwarded_for: bool,
}

impl RateLimitState {
    pub fn new(backend: Arc<dyn RateLimiterBackend>, api_key_header: HeaderName) -> Self {
        Self {
            backend,
            api_key_header,
            trust_forwarded_for: false,
        }
    }

    /// Take the client address from `X-Forwarded-For` when present.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

/// Ask the rate limiter about the request and either forward it or answer
/// 429 Too Many Requests.
///
/// Engine errors are rejected exactly like denials; only the log line tells
/// them apart.
#[instrument(
    skip_all,
    fields(method = %request.method(), path = %request.uri().path())
)]
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    // A key that is not valid UTF-8 is still a key
    let api_key = request
        .headers()
        .get(&state.api_key_header)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());
    let ip = client_ip(&request, state.trust_forwarded_for);

    match state.backend.check_request(api_key.as_deref(), &ip).await {
        Ok(Verdict::Allowed { remaining, .. }) => {
            debug!(client = %ip, remaining = remaining, "Request admitted");
            next.run(request).await
        }
        Ok(Verdict::Denied {
            reason,
            retry_after,
        }) => {
            debug!(
                client = %ip,
                reason = reason.as_str(),
                retry_after_secs = retry_after.as_secs(),
                "Request rejected"
            );
            too_many_requests(Some(retry_after))
        }
        Err(e) => {
            error!(
                client = %ip,
                kind = e.kind(),
                error = %e,
                "Rate limit check failed, rejecting request"
            );
            too_many_requests(None)
        }
    }
}

fn client_ip(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        if let Some(hop) = forwarded {
            return hop.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn too_many_requests(retry_after: Option<Duration>) -> Response {
    let mut response = (StatusCode::TOO_MANY_REQUESTS, RATE_LIMITED_MESSAGE).into_response();

    if let Some(wait) = retry_after {
        // Retry-After is whole seconds; round up so clients never come back early
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{Result, StoreError, TurnstileError};
    use crate::ratelimit::{DenyReason, LimitPolicy, LimitRule, RateLimiter};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use chrono::{DateTime, TimeDelta, Utc};
    use parking_lot::Mutex;
    use tower::ServiceExt;

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Allow,
        Deny,
        Fail,
    }

    /// Backend returning a fixed outcome and recording what it was asked.
    struct StubBackend {
        outcome: Outcome,
        seen: Mutex<Vec<(Option<String>, String)>>,
    }

    impl StubBackend {
        fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RateLimiterBackend for StubBackend {
        async fn check_request(&self, api_key: Option<&str>, ip: &str) -> Result<Verdict> {
            self.seen
                .lock()
                .push((api_key.map(str::to_owned), ip.to_string()));
            match self.outcome {
                Outcome::Allow => Ok(Verdict::Allowed {
                    limit: 10,
                    remaining: 9,
                }),
                Outcome::Deny => Ok(Verdict::Denied {
                    reason: DenyReason::StillBlocked,
                    retry_after: Duration::from_millis(2_500),
                }),
                Outcome::Fail => Err(TurnstileError::Store(StoreError::Backend(
                    "connection refused".to_string(),
                ))),
            }
        }
    }

    fn app(state: RateLimitState) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .route_layer(axum::middleware::from_fn_with_state(state, rate_limit))
    }

    fn request(api_key: Option<&str>, peer: [u8; 4]) -> Request {
        let mut builder = Request::builder()
            .uri("/")
            .extension(ConnectInfo(SocketAddr::from((peer, 40_000))));
        if let Some(key) = api_key {
            builder = builder.header("API_KEY", key);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn header_name() -> HeaderName {
        HeaderName::from_static("api_key")
    }

    #[tokio::test]
    async fn test_allowed_request_reaches_handler() {
        let backend = StubBackend::new(Outcome::Allow);
        let app = app(RateLimitState::new(backend.clone(), header_name()));

        let response = app.oneshot(request(Some("k-1"), [10, 0, 0, 1])).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
        assert_eq!(
            backend.seen.lock().as_slice(),
            &[(Some("k-1".to_string()), "10.0.0.1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_non_utf8_key_is_still_an_api_key() {
        let backend = StubBackend::new(Outcome::Allow);
        let app = app(RateLimitState::new(backend.clone(), header_name()));

        let mut request = request(None, [10, 0, 0, 5]);
        request.headers_mut().insert(
            header_name(),
            HeaderValue::from_bytes(b"caf\xe9-key").unwrap(),
        );
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let seen = backend.seen.lock();
        assert_eq!(seen[0].0.as_deref(), Some("caf\u{FFFD}-key"));
        assert_eq!(seen[0].1, "10.0.0.5");
    }

    #[tokio::test]
    async fn test_denied_request_gets_429_with_retry_after() {
        let backend = StubBackend::new(Outcome::Deny);
        let app = app(RateLimitState::new(backend, header_name()));

        let response = app.oneshot(request(None, [10, 0, 0, 2])).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
        assert_eq!(body_text(response).await, RATE_LIMITED_MESSAGE);
    }

    #[tokio::test]
    async fn test_engine_error_fails_closed() {
        let backend = StubBackend::new(Outcome::Fail);
        let app = app(RateLimitState::new(backend, header_name()));

        let response = app.oneshot(request(None, [10, 0, 0, 3])).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
        assert_eq!(body_text(response).await, RATE_LIMITED_MESSAGE);
    }

    #[tokio::test]
    async fn test_missing_peer_address_is_unknown() {
        let backend = StubBackend::new(Outcome::Allow);
        let app = app(RateLimitState::new(backend.clone(), header_name()));

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap();

        assert_eq!(backend.seen.lock()[0], (None, UNKNOWN_CLIENT.to_string()));
    }

    #[tokio::test]
    async fn test_forwarded_for_only_when_trusted() {
        let forwarded = |app: Router| async move {
            let mut request = request(None, [10, 0, 0, 4]);
            request.headers_mut().insert(
                X_FORWARDED_FOR,
                HeaderValue::from_static("203.0.113.9, 10.0.0.254"),
            );
            app.oneshot(request).await.unwrap();
        };

        let untrusted = StubBackend::new(Outcome::Allow);
        forwarded(app(RateLimitState::new(untrusted.clone(), header_name()))).await;
        assert_eq!(untrusted.seen.lock()[0].1, "10.0.0.4");

        let trusted = StubBackend::new(Outcome::Allow);
        forwarded(app(
            RateLimitState::new(trusted.clone(), header_name()).trust_forwarded_for(true),
        ))
        .await;
        assert_eq!(trusted.seen.lock()[0].1, "203.0.113.9");
    }

    #[tokio::test]
    async fn test_end_to_end_with_engine() {
        let start = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            LimitPolicy::new(LimitRule::new(2, 10, 30), Some(LimitRule::new(3, 10, 30))),
        )
        .with_clock(clock.clone());
        let app = app(RateLimitState::new(Arc::new(limiter), header_name()));

        // IP class: 2 per window
        for _ in 0..2 {
            let response = app.clone().oneshot(request(None, [10, 9, 9, 9])).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(request(None, [10, 9, 9, 9])).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");

        // Same address with an API key is counted under the key's class
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(request(Some("partner"), [10, 9, 9, 9]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        // Once the block lapses the address is admitted again
        clock.advance(TimeDelta::seconds(31));
        let response = app.clone().oneshot(request(None, [10, 9, 9, 9])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
