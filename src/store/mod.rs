//! Persisted limiter state.
//!
//! Trackers and block markers live behind [`StateStore`] so that several
//! server processes can share them. Two backends ship with the crate: an
//! in-process [`MemoryStore`] and, with the `redis` feature, a [`RedisStore`].

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::StoreError;
use crate::ratelimit::WindowTracker;

/// Whether an identity is currently serving a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Blocked until the given instant
    Blocked { until: DateTime<Utc> },
    NotBlocked,
}

/// Storage interface consumed by the decision engine.
///
/// All keys are already namespaced by identity class (see
/// [`Identity::store_key`](crate::ratelimit::Identity::store_key)).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Report the block status of `identity` as seen at `now`.
    async fn get_block_status(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<BlockStatus, StoreError>;

    /// Block `identity` from `now` for `duration`, replacing any marker.
    async fn save_blocked_duration(
        &self,
        identity: &str,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<(), StoreError>;

    /// Fetch the tracker for `identity`, or an empty one if unseen.
    async fn get_request(&self, identity: &str) -> Result<WindowTracker, StoreError>;

    /// Unconditionally write the tracker for `identity`.
    async fn upsert_request(
        &self,
        identity: &str,
        tracker: &WindowTracker,
    ) -> Result<(), StoreError>;

    /// Write the tracker only if the stored revision still equals
    /// `tracker.revision` (a missing record counts as revision 0).
    ///
    /// The stored copy gets `tracker.revision + 1`. Returns `Ok(false)` when
    /// another writer got there first.
    async fn compare_and_upsert_request(
        &self,
        identity: &str,
        tracker: &WindowTracker,
    ) -> Result<bool, StoreError>;
}
