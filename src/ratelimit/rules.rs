//! Limit rules and the per-class policy that selects them.
//!
//! Two identity classes exist: callers presenting an API key and callers
//! known only by source IP. Each class has its own rule; API keys may
//! additionally carry dedicated rules loaded from a YAML rules file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::identity::Identity;
use crate::error::{ConfigError, Result, TurnstileError};

/// Limits applied to one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Requests allowed per window
    pub max_requests: u64,
    /// Length of the sliding window in seconds
    pub window_secs: u64,
    /// How long an identity stays blocked after exceeding the limit
    pub block_duration_secs: u64,
}

impl LimitRule {
    pub fn new(max_requests: u64, window_secs: u64, block_duration_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
            block_duration_secs,
        }
    }

    /// Every field must be non-zero.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::ZeroMaxRequests);
        }
        if self.window_secs == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.block_duration_secs == 0 {
            return Err(ConfigError::ZeroBlockDuration);
        }
        Ok(())
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }
}

/// Dedicated rules keyed by API key value, as found in the rules file.
///
/// ```yaml
/// api_keys:
///   partner-7f3a:
///     max_requests: 500
///     window_secs: 60
///     block_duration_secs: 120
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRules {
    #[serde(default)]
    pub api_keys: HashMap<String, LimitRule>,
}

impl ApiKeyRules {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading API key rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: ApiKeyRules = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Load(format!("Failed to parse API key rules: {}", e)))?;

        for (key, rule) in &rules.api_keys {
            rule.validate().map_err(|e| {
                ConfigError::Invalid(format!("rule for API key {:?}: {}", key, e))
            })?;
        }
        Ok(rules)
    }
}

/// The complete set of limits consulted by the identity selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitPolicy {
    /// Rule for callers identified by source IP
    pub by_ip: LimitRule,
    /// Default rule for API keys without a dedicated entry
    pub by_api_key: Option<LimitRule>,
    /// Dedicated per-key rules
    pub api_keys: HashMap<String, LimitRule>,
}

impl LimitPolicy {
    pub fn new(by_ip: LimitRule, by_api_key: Option<LimitRule>) -> Self {
        Self {
            by_ip,
            by_api_key,
            api_keys: HashMap::new(),
        }
    }

    /// Replace the dedicated per-key rules.
    pub fn with_api_keys(mut self, rules: ApiKeyRules) -> Self {
        self.api_keys = rules.api_keys;
        self
    }

    /// Check every rule the policy can hand out.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.by_ip
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("by_ip: {}", e)))?;
        if let Some(rule) = &self.by_api_key {
            rule.validate()
                .map_err(|e| ConfigError::Invalid(format!("by_api_key: {}", e)))?;
        }
        for (key, rule) in &self.api_keys {
            rule.validate().map_err(|e| {
                ConfigError::Invalid(format!("rule for API key {:?}: {}", key, e))
            })?;
        }
        Ok(())
    }

    /// Find the rule governing an identity.
    ///
    /// An API key never falls back to the IP rule: with no dedicated entry
    /// and no class default it is reported as unknown.
    pub fn rule_for(&self, identity: &Identity) -> std::result::Result<LimitRule, ConfigError> {
        match identity {
            Identity::Ip(_) => Ok(self.by_ip),
            Identity::ApiKey(key) => self
                .api_keys
                .get(key)
                .copied()
                .or(self.by_api_key)
                .ok_or_else(|| ConfigError::UnknownApiKey(key.clone())),
        }
    }
}
