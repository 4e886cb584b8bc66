//! Configuration management for Turnstile.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `TURNSTILE__`-prefixed environment variables
//! (e.g. `TURNSTILE__RATE_LIMITING__BY_IP__MAX_REQUESTS=20`).

use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, Result, TurnstileError};
use crate::ratelimit::{Consistency, EngineSettings, LimitPolicy, LimitRule};

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "TURNSTILE";
/// Separator between prefix and nested keys in environment overrides.
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// State store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Header carrying the caller's API key
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Take the client address from the first `X-Forwarded-For` hop
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            api_key_header: default_api_key_header(),
            trust_forwarded_for: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_api_key_header() -> String {
    "API_KEY".to_string()
}

/// Which state store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local maps; only correct for a single instance
    #[default]
    Memory,
    /// Shared Redis instance
    Redis,
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single store call in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// How often the memory store drops expired state
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "turnstile".to_string()
}

fn default_operation_timeout() -> u64 {
    500
}

fn default_sweep_interval() -> u64 {
    60
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Limits for callers identified by source IP
    #[serde(default = "default_ip_rule")]
    pub by_ip: LimitRule,

    /// Default limits for API keys without a dedicated rule; when unset,
    /// such keys are rejected as unknown
    #[serde(default = "default_api_key_rule")]
    pub by_api_key: Option<LimitRule>,

    /// Path to the per-API-key rules file
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Rules file reload interval in seconds (0 disables reloading)
    #[serde(default = "default_reload_interval")]
    pub config_reload_interval_secs: u64,

    /// Write strategy for trackers
    #[serde(default)]
    pub consistency: Consistency,

    /// Conditional write attempts per cycle in `compare_and_set` mode
    #[serde(default = "default_cas_attempts")]
    pub cas_max_attempts: u32,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            by_ip: default_ip_rule(),
            by_api_key: default_api_key_rule(),
            rules_path: None,
            config_reload_interval_secs: default_reload_interval(),
            consistency: Consistency::default(),
            cas_max_attempts: default_cas_attempts(),
        }
    }
}

fn default_ip_rule() -> LimitRule {
    LimitRule::new(10, 1, 60)
}

fn default_api_key_rule() -> Option<LimitRule> {
    Some(LimitRule::new(100, 1, 60))
}

fn default_reload_interval() -> u64 {
    60
}

fn default_cas_attempts() -> u32 {
    5
}

impl TurnstileConfig {
    /// Load configuration from defaults, an optional YAML file and the
    /// environment, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Self::builder()?;
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        Self::finish(builder)
    }

    /// Load configuration from a YAML string on top of the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let builder = Self::builder()?
            .add_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml));
        Self::finish(builder)
    }

    /// A builder seeded with the class rules, so a source that sets a
    /// single field of a rule merges with the rest of its defaults.
    fn builder() -> Result<::config::ConfigBuilder<::config::builder::DefaultState>> {
        let mut builder = ::config::Config::builder();
        let classes = [
            ("by_ip", Some(default_ip_rule())),
            ("by_api_key", default_api_key_rule()),
        ];

        for (class, rule) in classes {
            let Some(rule) = rule else { continue };
            let prefix = format!("rate_limiting.{}", class);
            builder = builder
                .set_default(format!("{}.max_requests", prefix), rule.max_requests)
                .and_then(|b| b.set_default(format!("{}.window_secs", prefix), rule.window_secs))
                .and_then(|b| {
                    b.set_default(
                        format!("{}.block_duration_secs", prefix),
                        rule.block_duration_secs,
                    )
                })
                .map_err(|e| TurnstileError::Load(e.to_string()))?;
        }
        Ok(builder)
    }

    fn finish(builder: ::config::ConfigBuilder<::config::builder::DefaultState>) -> Result<Self> {
        let config: TurnstileConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TurnstileError::Load(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.policy().validate()?;
        self.api_key_header()?;

        if self.store.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "store.operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting.cas_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "rate_limiting.cas_max_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The class rules, without any per-key entries.
    pub fn policy(&self) -> LimitPolicy {
        LimitPolicy::new(self.rate_limiting.by_ip, self.rate_limiting.by_api_key)
    }

    /// The API key header as an HTTP header name.
    pub fn api_key_header(&self) -> std::result::Result<HeaderName, ConfigError> {
        HeaderName::from_bytes(self.server.api_key_header.to_ascii_lowercase().as_bytes())
            .map_err(|_| {
                ConfigError::Invalid(format!(
                    "server.api_key_header {:?} is not a valid header name",
                    self.server.api_key_header
                ))
            })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            store_timeout: Duration::from_millis(self.store.operation_timeout_ms),
            consistency: self.rate_limiting.consistency,
            cas_max_attempts: self.rate_limiting.cas_max_attempts,
        }
    }

    /// Rules file reload interval, or `None` when reloading is off.
    pub fn reload_interval(&self) -> Option<Duration> {
        match self.rate_limiting.config_reload_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
