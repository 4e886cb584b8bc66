//! Identity selection: who a request is counted against.

use super::rules::{LimitPolicy, LimitRule};
use crate::error::ConfigError;

/// The identity a request is rate limited under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Caller presented an API key
    ApiKey(String),
    /// Caller known only by source address
    Ip(String),
}

impl Identity {
    /// Pick the identity for a request.
    ///
    /// A non-empty API key always wins, whether or not any rule exists for
    /// it. The key is used exactly as presented.
    pub fn select(api_key: Option<&str>, ip: &str) -> Self {
        match api_key.filter(|key| !key.is_empty()) {
            Some(key) => Identity::ApiKey(key.to_string()),
            None => Identity::Ip(ip.to_string()),
        }
    }

    /// Short class label for logs.
    pub fn class(&self) -> &'static str {
        match self {
            Identity::ApiKey(_) => "api_key",
            Identity::Ip(_) => "ip",
        }
    }

    /// The raw identity value.
    pub fn value(&self) -> &str {
        match self {
            Identity::ApiKey(value) | Identity::Ip(value) => value,
        }
    }

    /// Namespaced key used for persisted state.
    ///
    /// The class prefix keeps an API key that happens to look like an
    /// address from sharing a record with that address.
    pub fn store_key(&self) -> String {
        match self {
            Identity::ApiKey(key) => format!("apikey:{}", key),
            Identity::Ip(ip) => format!("ip:{}", ip),
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Never print a full key into logs
            Identity::ApiKey(key) => {
                let shown: String = key.chars().take(4).collect();
                write!(f, "api_key:{}...", shown)
            }
            Identity::Ip(ip) => write!(f, "ip:{}", ip),
        }
    }
}

/// An identity paired with the rule that governs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub identity: Identity,
    pub rule: LimitRule,
}

impl Selection {
    /// Resolve identity and rule for one request.
    pub fn resolve(
        policy: &LimitPolicy,
        api_key: Option<&str>,
        ip: &str,
    ) -> Result<Self, ConfigError> {
        let identity = Identity::select(api_key, ip);
        let rule = policy.rule_for(&identity)?;
        Ok(Self { identity, rule })
    }
}
