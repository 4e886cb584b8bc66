//! Single-process state store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::{BlockStatus, StateStore};
use crate::error::StoreError;
use crate::ratelimit::window::seconds;
use crate::ratelimit::WindowTracker;

/// In-memory store backed by concurrent maps.
///
/// Suitable for a single instance and for tests. Lapsed block markers are
/// dropped lazily on read; [`MemoryStore::purge_expired`] clears the rest.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    trackers: Arc<DashMap<String, WindowTracker>>,
    blocks: Arc<DashMap<String, DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop trackers whose whole history is outside their window and block
    /// markers that have lapsed. Returns how many records were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.trackers.len() + self.blocks.len();
        self.trackers.retain(|_, tracker| !tracker.is_stale(now));
        self.blocks.retain(|_, until| *until > now);
        let removed = before.saturating_sub(self.trackers.len() + self.blocks.len());

        trace!(removed = removed, "Purged expired limiter state");
        removed
    }

    /// Number of trackers held.
    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    /// Number of block markers held.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_block_status(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<BlockStatus, StoreError> {
        let until = match self.blocks.get(identity) {
            Some(until) => *until,
            None => return Ok(BlockStatus::NotBlocked),
        };

        if now < until {
            Ok(BlockStatus::Blocked { until })
        } else {
            self.blocks.remove_if(identity, |_, stored| *stored <= now);
            Ok(BlockStatus::NotBlocked)
        }
    }

    async fn save_blocked_duration(
        &self,
        identity: &str,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<(), StoreError> {
        let until = now
            .checked_add_signed(seconds(duration.as_secs()))
            .ok_or_else(|| StoreError::Backend("block expiry out of range".to_string()))?;
        self.blocks.insert(identity.to_string(), until);
        Ok(())
    }

    async fn get_request(&self, identity: &str) -> Result<WindowTracker, StoreError> {
        Ok(self
            .trackers
            .get(identity)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn upsert_request(
        &self,
        identity: &str,
        tracker: &WindowTracker,
    ) -> Result<(), StoreError> {
        self.trackers.insert(identity.to_string(), tracker.clone());
        Ok(())
    }

    async fn compare_and_upsert_request(
        &self,
        identity: &str,
        tracker: &WindowTracker,
    ) -> Result<bool, StoreError> {
        let mut next = tracker.clone();
        next.revision = tracker.revision + 1;

        match self.trackers.entry(identity.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().revision != tracker.revision {
                    return Ok(false);
                }
                entry.insert(next);
            }
            Entry::Vacant(entry) => {
                if tracker.revision != 0 {
                    return Ok(false);
                }
                entry.insert(next);
            }
        }
        Ok(true)
    }
}
