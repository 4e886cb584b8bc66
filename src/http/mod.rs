//! HTTP surface: the rate limiting middleware and the server wiring it up.

mod middleware;
mod server;

pub use middleware::{rate_limit, RateLimitState, RATE_LIMITED_MESSAGE};
pub use server::{router, HttpServer};
