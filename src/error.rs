//! Error types for the Turnstile service.

use std::time::Duration;
use thiserror::Error;

/// Invalid or missing limit configuration.
///
/// These are never retried and never turned into a silent default: a cycle
/// that hits one is treated as denied by the HTTP layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_requests` was zero
    #[error("max_requests must be greater than zero")]
    ZeroMaxRequests,

    /// `window_secs` was zero
    #[error("window_secs must be greater than zero")]
    ZeroWindow,

    /// `block_duration_secs` was zero
    #[error("block_duration_secs must be greater than zero")]
    ZeroBlockDuration,

    /// An API key with neither a dedicated rule nor a class default
    #[error("no rate limit configured for API key {0:?}")]
    UnknownApiKey(String),

    /// Any other malformed setting
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure reading or writing persisted limiter state.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend rejected or failed the operation
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored record could not be encoded or decoded
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The operation did not finish before the cycle deadline
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Compare-and-set kept losing to concurrent writers
    #[error("store contention: gave up after {attempts} compare-and-set attempts")]
    Contention { attempts: u32 },

    /// Redis client errors
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Limit configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Settings could not be loaded or parsed
    #[error("Failed to load settings: {0}")]
    Load(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Short, stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TurnstileError::Config(_) => "config_error",
            TurnstileError::Store(_) => "store_error",
            TurnstileError::Load(_) => "load_error",
            TurnstileError::Io(_) => "io_error",
        }
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
