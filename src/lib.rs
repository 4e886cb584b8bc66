//! Turnstile - HTTP Request Rate Limiting
//!
//! This crate implements sliding-window admission control for HTTP services.
//! Callers are identified by API key when one is presented and by source IP
//! otherwise; each identity gets a request budget per window and is blocked
//! for a cooldown once it goes over. Window and block state lives behind a
//! [`store::StateStore`] so several instances can share it through Redis.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
