//! Sliding-window request tracker.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest second count a `TimeDelta` can hold.
const MAX_DELTA_SECS: u64 = (i64::MAX / 1_000) as u64;

/// Convert a whole number of seconds into a `TimeDelta`, saturating instead
/// of panicking on absurd values.
pub(crate) fn seconds(secs: u64) -> TimeDelta {
    TimeDelta::seconds(secs.min(MAX_DELTA_SECS) as i64)
}

/// The recent request history of one identity.
///
/// Timestamps are appended in arrival order, so the sequence is always
/// oldest-first and pruning is a prefix cut.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowTracker {
    /// Request instants, oldest first
    #[serde(default)]
    pub requests: Vec<DateTime<Utc>>,
    /// Length of the sliding window in seconds
    #[serde(default)]
    pub window_secs: u64,
    /// Requests allowed per window
    #[serde(default)]
    pub max_requests: u64,
    /// Persistence revision, bumped by the store on every conditional write
    #[serde(default)]
    pub revision: u64,
}

impl WindowTracker {
    /// Create an empty tracker with the given limits.
    pub fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            requests: Vec::new(),
            window_secs,
            max_requests,
            revision: 0,
        }
    }

    /// Overwrite the limits, keeping the recorded history.
    pub fn configure(&mut self, max_requests: u64, window_secs: u64) {
        self.max_requests = max_requests;
        self.window_secs = window_secs;
    }

    /// Reject limits that would make every decision meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::ZeroMaxRequests);
        }
        if self.window_secs == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(())
    }

    /// Append a request made at `now`. Does not prune.
    pub fn record_request(&mut self, now: DateTime<Utc>) {
        self.requests.push(now);
    }

    /// Prune, then report whether the window still fits the limit.
    ///
    /// The current request is expected to be recorded already, so the
    /// `(max_requests + 1)`-th request inside one window is the first to fail.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        self.prune(now);
        self.count() <= self.max_requests
    }

    /// Drop every request at or before `now - window`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let threshold = now
            .checked_sub_signed(seconds(self.window_secs))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        match self.requests.iter().position(|t| *t > threshold) {
            Some(0) => {}
            Some(start) => {
                self.requests.drain(..start);
            }
            None => self.requests.clear(),
        }
    }

    /// Number of requests currently held.
    pub fn count(&self) -> u64 {
        self.requests.len() as u64
    }

    /// Budget left in the window after the recorded requests.
    pub fn remaining(&self) -> u64 {
        self.max_requests.saturating_sub(self.count())
    }

    /// When the oldest held request leaves the window.
    pub fn resets_at(&self) -> Option<DateTime<Utc>> {
        self.requests
            .first()
            .and_then(|oldest| oldest.checked_add_signed(seconds(self.window_secs)))
    }

    /// Whether every held request is outside the window at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.requests.last() {
            Some(newest) => newest
                .checked_add_signed(seconds(self.window_secs))
                .map_or(false, |expiry| expiry <= now),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        assert_eq!(
            WindowTracker::new(0, 10).validate(),
            Err(ConfigError::ZeroMaxRequests)
        );
        assert_eq!(
            WindowTracker::new(5, 0).validate(),
            Err(ConfigError::ZeroWindow)
        );
        assert!(WindowTracker::new(5, 10).validate().is_ok());
    }

    #[test]
    fn test_allow_within_limit() {
        let mut tracker = WindowTracker::new(3, 10);

        for i in 0..3 {
            tracker.record_request(at(i));
            assert!(tracker.allow(at(i)), "request {} should be allowed", i + 1);
        }
        assert_eq!(tracker.remaining(), 0);
    }

    #[test]
    fn test_allow_rejects_request_over_limit() {
        let mut tracker = WindowTracker::new(2, 10);

        tracker.record_request(at(0));
        assert!(tracker.allow(at(0)));
        tracker.record_request(at(1));
        assert!(tracker.allow(at(1)));

        // The 3rd request inside 10s is the first rejected one
        tracker.record_request(at(2));
        assert!(!tracker.allow(at(2)));
    }

    #[test]
    fn test_prune_drops_old_requests() {
        let mut tracker = WindowTracker::new(10, 10);
        for i in [0, 3, 6, 9, 12] {
            tracker.record_request(at(i));
        }

        tracker.prune(at(15));

        // Threshold is t=5, so 0 and 3 go
        assert_eq!(tracker.requests, vec![at(6), at(9), at(12)]);
    }

    #[test]
    fn test_prune_boundary_is_exclusive() {
        let mut tracker = WindowTracker::new(10, 10);
        tracker.record_request(at(0));
        tracker.record_request(at(1));

        // Threshold equals the first timestamp: it is no longer "after" it
        tracker.prune(at(10));
        assert_eq!(tracker.requests, vec![at(1)]);
    }

    #[test]
    fn test_prune_empties_when_nothing_survives() {
        let mut tracker = WindowTracker::new(10, 10);
        tracker.record_request(at(0));
        tracker.record_request(at(1));
        tracker.record_request(at(2));

        tracker.prune(at(30));
        assert!(tracker.requests.is_empty());
    }

    #[test]
    fn test_prune_is_idempotent() {
        let mut tracker = WindowTracker::new(10, 10);
        for i in [0, 4, 8, 12, 16] {
            tracker.record_request(at(i));
        }

        tracker.prune(at(20));
        let once = tracker.requests.clone();
        tracker.prune(at(20));
        assert_eq!(tracker.requests, once);
    }

    #[test]
    fn test_window_slides() {
        let mut tracker = WindowTracker::new(2, 10);

        tracker.record_request(at(0));
        assert!(tracker.allow(at(0)));
        tracker.record_request(at(5));
        assert!(tracker.allow(at(5)));

        // t=0 has left the window by t=11
        tracker.record_request(at(11));
        assert!(tracker.allow(at(11)));
        assert_eq!(tracker.requests, vec![at(5), at(11)]);
    }

    #[test]
    fn test_resets_at_and_staleness() {
        let mut tracker = WindowTracker::new(2, 10);
        assert!(tracker.is_stale(at(0)));
        assert_eq!(tracker.resets_at(), None);

        tracker.record_request(at(3));
        tracker.record_request(at(4));
        assert_eq!(tracker.resets_at(), Some(at(13)));
        assert!(!tracker.is_stale(at(13)));
        assert!(tracker.is_stale(at(14)));
    }

    #[test]
    fn test_tracker_serde_defaults() {
        let tracker: WindowTracker = serde_json::from_str("{}").unwrap();
        assert_eq!(tracker, WindowTracker::default());
    }
}
