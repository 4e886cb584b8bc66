//! Rate limiter trait consumed by the HTTP layer.

use async_trait::async_trait;

use super::limiter::Verdict;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// The middleware only needs "decide for this request"; abstracting it keeps
/// the HTTP layer independent of the store type behind the engine.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Decide whether a request carrying `api_key` (if any) from `ip` may
    /// proceed.
    async fn check_request(&self, api_key: Option<&str>, ip: &str) -> Result<Verdict>;
}
