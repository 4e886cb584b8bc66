//! The rate decision engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::RateLimiterBackend;
use super::identity::{Identity, Selection};
use super::rules::{LimitPolicy, LimitRule};
use super::window::WindowTracker;
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, Result, StoreError};
use crate::store::{BlockStatus, StateStore};

/// Default bound on a single store call.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);
/// Default number of conditional writes before giving up.
const DEFAULT_CAS_ATTEMPTS: u32 = 5;

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// This request pushed the window past its limit
    OverLimit,
    /// The identity is serving a block from an earlier violation
    StillBlocked,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::OverLimit => "over_limit",
            DenyReason::StillBlocked => "still_blocked",
        }
    }
}

/// Outcome of one decision cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed {
        /// Requests allowed per window
        limit: u64,
        /// Requests left in the current window
        remaining: u64,
    },
    Denied {
        reason: DenyReason,
        /// How long until the identity may try again
        retry_after: Duration,
    },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed { .. })
    }
}

/// How the tracker write at the end of a cycle deals with concurrent writers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Plain read-modify-write; concurrent cycles may drop an append
    #[default]
    LastWriteWins,
    /// Conditional write on the tracker revision, retried on conflict
    CompareAndSet,
}

/// Tunables of the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Upper bound on each store call
    pub store_timeout: Duration,
    pub consistency: Consistency,
    /// Conditional writes attempted per cycle in `CompareAndSet` mode
    pub cas_max_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            consistency: Consistency::default(),
            cas_max_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }
}

/// Sliding-window rate limiter over a shared [`StateStore`].
///
/// No request state is held in process: every cycle reads the identity's
/// block marker and tracker from the store, decides, and writes back.
pub struct RateLimiter<S: StateStore> {
    store: Arc<S>,
    policy: RwLock<LimitPolicy>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl<S: StateStore> RateLimiter<S> {
    /// Create a rate limiter with default settings and the system clock.
    pub fn new(store: Arc<S>, policy: LimitPolicy) -> Self {
        Self {
            store,
            policy: RwLock::new(policy),
            clock: Arc::new(SystemClock),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the limit policy. Cycles already running keep the old rule.
    pub fn set_policy(&self, policy: LimitPolicy) {
        *self.policy.write() = policy;
    }

    /// Get the current policy.
    pub fn policy(&self) -> LimitPolicy {
        self.policy.read().clone()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Select identity and rule for a request, then run a decision cycle at
    /// the clock's current time.
    pub async fn check_request(&self, api_key: Option<&str>, ip: &str) -> Result<Verdict> {
        let selection = Selection::resolve(&self.policy.read(), api_key, ip)?;
        let now = self.clock.now();
        self.check_rate_limit(&selection.identity, &selection.rule, now)
            .await
    }

    /// Run one decision cycle for `identity` under `rule` at `now`.
    pub async fn check_rate_limit(
        &self,
        identity: &Identity,
        rule: &LimitRule,
        now: DateTime<Utc>,
    ) -> Result<Verdict> {
        let key = identity.store_key();

        trace!(
            identity = %identity,
            max_requests = rule.max_requests,
            window_secs = rule.window_secs,
            "Checking rate limit"
        );

        if let BlockStatus::Blocked { until } =
            self.bounded(self.store.get_block_status(&key, now)).await?
        {
            let retry_after = (until - now).to_std().unwrap_or_default();
            debug!(
                identity = %identity,
                until = %until,
                "Identity still blocked"
            );
            return Ok(Verdict::Denied {
                reason: DenyReason::StillBlocked,
                retry_after,
            });
        }

        let (allowed, tracker) = match self.settings.consistency {
            Consistency::LastWriteWins => self.record_last_write_wins(&key, rule, now).await?,
            Consistency::CompareAndSet => self.record_compare_and_set(&key, rule, now).await?,
        };

        if !allowed {
            let block = rule.block_duration();
            // The verdict stands even if the marker cannot be written
            match self
                .bounded(self.store.save_blocked_duration(&key, now, block))
                .await
            {
                Ok(()) => debug!(
                    identity = %identity,
                    count = tracker.count(),
                    limit = tracker.max_requests,
                    block_secs = block.as_secs(),
                    "Rate limit exceeded, identity blocked"
                ),
                Err(e) => warn!(
                    identity = %identity,
                    error = %e,
                    "Rate limit exceeded but block marker could not be stored"
                ),
            }

            return Ok(Verdict::Denied {
                reason: DenyReason::OverLimit,
                retry_after: block,
            });
        }

        Ok(Verdict::Allowed {
            limit: tracker.max_requests,
            remaining: tracker.remaining(),
        })
    }

    async fn record_last_write_wins(
        &self,
        key: &str,
        rule: &LimitRule,
        now: DateTime<Utc>,
    ) -> Result<(bool, WindowTracker)> {
        let mut tracker = self.bounded(self.store.get_request(key)).await?;
        let allowed = admit(&mut tracker, rule, now)?;
        self.bounded(self.store.upsert_request(key, &tracker)).await?;
        Ok((allowed, tracker))
    }

    async fn record_compare_and_set(
        &self,
        key: &str,
        rule: &LimitRule,
        now: DateTime<Utc>,
    ) -> Result<(bool, WindowTracker)> {
        let attempts = self.settings.cas_max_attempts.max(1);

        for attempt in 1..=attempts {
            let mut tracker = self.bounded(self.store.get_request(key)).await?;
            let allowed = admit(&mut tracker, rule, now)?;

            if self
                .bounded(self.store.compare_and_upsert_request(key, &tracker))
                .await?
            {
                return Ok((allowed, tracker));
            }
            trace!(key = %key, attempt = attempt, "Tracker changed underneath us, retrying");
        }

        Err(StoreError::Contention { attempts }.into())
    }

    /// Bound a store call by the configured timeout.
    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.settings.store_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.settings.store_timeout).into()),
        }
    }
}

/// Apply `rule` to the loaded tracker, record the request and decide.
///
/// Validation happens before any mutation, so a bad rule leaves nothing to
/// persist.
fn admit(
    tracker: &mut WindowTracker,
    rule: &LimitRule,
    now: DateTime<Utc>,
) -> std::result::Result<bool, ConfigError> {
    tracker.configure(rule.max_requests, rule.window_secs);
    tracker.validate()?;
    rule.validate()?;

    tracker.record_request(now);
    Ok(tracker.allow(now))
}

#[async_trait]
impl<S: StateStore + 'static> RateLimiterBackend for RateLimiter<S> {
    async fn check_request(&self, api_key: Option<&str>, ip: &str) -> Result<Verdict> {
        RateLimiter::check_request(self, api_key, ip).await
    }
}
