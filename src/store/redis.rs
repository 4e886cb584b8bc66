//! Redis-backed state store shared by every server instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tracing::{debug, info};

use super::{BlockStatus, StateStore};
use crate::error::StoreError;
use crate::ratelimit::window::seconds;
use crate::ratelimit::WindowTracker;

/// Conditional tracker write.
///
/// KEYS[1] tracker key; ARGV[1] expected revision; ARGV[2] encoded tracker
/// (already carrying the next revision); ARGV[3] expiry in seconds.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
local revision = 0
if current then
  revision = tonumber(cjson.decode(current)['revision']) or 0
end
if revision ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
return 1
"#;

/// State store backed by Redis.
///
/// Trackers are stored as JSON under `<prefix>:requests:<identity>` and
/// expire once their window has passed; block markers hold the blocked-until
/// instant in epoch milliseconds under `<prefix>:blocked:<identity>` and
/// expire with the block.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    compare_and_set: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis at `url`. Keys are prefixed with `prefix`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let prefix = prefix.into();

        info!(prefix = %prefix, "Connected to Redis state store");
        Ok(Self {
            conn,
            prefix,
            compare_and_set: Script::new(COMPARE_AND_SET),
        })
    }

    /// Round-trip a PING.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn requests_key(&self, identity: &str) -> String {
        requests_key(&self.prefix, identity)
    }

    fn blocked_key(&self, identity: &str) -> String {
        blocked_key(&self.prefix, identity)
    }
}

fn requests_key(prefix: &str, identity: &str) -> String {
    format!("{}:requests:{}", prefix, identity)
}

fn blocked_key(prefix: &str, identity: &str) -> String {
    format!("{}:blocked:{}", prefix, identity)
}

/// Trackers are useless once their window has passed; never let Redis keep
/// one for less than a second.
fn tracker_ttl_secs(tracker: &WindowTracker) -> u64 {
    tracker.window_secs.max(1)
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get_block_status(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<BlockStatus, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<i64> = redis::cmd("GET")
            .arg(self.blocked_key(identity))
            .query_async(&mut conn)
            .await?;

        let until = match raw.and_then(DateTime::<Utc>::from_timestamp_millis) {
            Some(until) => until,
            None => return Ok(BlockStatus::NotBlocked),
        };

        if now < until {
            Ok(BlockStatus::Blocked { until })
        } else {
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
        let ttl_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.blocked_key(identity))
            .arg(until.timestamp_millis())
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        debug!(identity = %identity, until = %until, "Stored block marker");
        Ok(())
    }

    async fn get_request(&self, identity: &str) -> Result<WindowTracker, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.requests_key(identity))
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(WindowTracker::default()),
        }
    }

    async fn upsert_request(
        &self,
        identity: &str,
        tracker: &WindowTracker,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(tracker)?;

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.requests_key(identity))
            .arg(json)
            .arg("EX")
            .arg(tracker_ttl_secs(tracker))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn compare_and_upsert_request(
        &self,
        identity: &str,
        tracker: &WindowTracker,
    ) -> Result<bool, StoreError> {
        let mut next = tracker.clone();
        next.revision = tracker.revision + 1;
        let json = serde_json::to_string(&next)?;

        let mut conn = self.conn.clone();
        let written: i64 = self
            .compare_and_set
            .key(self.requests_key(identity))
            .arg(tracker.revision)
            .arg(json)
            .arg(tracker_ttl_secs(tracker))
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }
}
