//! Rate limiting logic: window tracking, identity selection and decisions.

mod backend;
mod identity;
mod limiter;
mod rules;
pub(crate) mod window;

pub use backend::RateLimiterBackend;
pub use identity::{Identity, Selection};
pub use limiter::{Consistency, DenyReason, EngineSettings, RateLimiter, Verdict};
pub use rules::{ApiKeyRules, LimitPolicy, LimitRule};
pub use window::WindowTracker;
