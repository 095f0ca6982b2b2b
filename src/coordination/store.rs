//! Store capability interface shared by the lock and the queue.
//!
//! Both primitives talk to the backing store exclusively through the
//! [`LockStore`] and [`StreamStore`] traits.  [`super::redis::RedisStore`]
//! implements them on top of a fred connection pool and
//! [`super::memory::MemoryStore`] implements them in-process.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// A server-side script executed atomically by [`LockStore::run_script`].
///
/// `name` identifies the script to stores that cannot evaluate Lua and
/// therefore carry a native rendition of the same steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Script {
    pub name: &'static str,
    pub lua: &'static str,
}

// ---------------------------------------------------------------------------
// Stream types
// ---------------------------------------------------------------------------

/// A stream entry ID (`<ms>-<seq>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Parse a range bound.  `-` and `+` are the open ends; an ID without a
    /// sequence part covers the whole millisecond, so its lower bound is
    /// `<ms>-0` and its upper bound `<ms>-<u64::MAX>`.
    pub fn parse_bound(s: &str, upper: bool) -> Result<Self> {
        match s {
            "-" => Ok(Self::MIN),
            "+" => Ok(Self::MAX),
            _ if !s.contains('-') => {
                let ms = s.parse().map_err(|_| {
                    anyhow!("ERR Invalid stream ID specified as stream command argument")
                })?;
                Ok(Self::new(ms, if upper { u64::MAX } else { 0 }))
            }
            _ => s.parse(),
        }
    }
}

impl Ord for StreamId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ms, self.seq).cmp(&(other.ms, other.seq))
    }
}

impl PartialOrd for StreamId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for StreamId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || anyhow!("ERR Invalid stream ID specified as stream command argument");
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// One entry as returned by a group read or range scan.
///
/// `fields` is `None` when the entry is still referenced by a pending list
/// but has been removed from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Option<Vec<(String, String)>>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .as_ref()?
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Summary form of a consumer group's pending-entries list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub count: u64,
    pub lowest: Option<String>,
    pub highest: Option<String>,
    /// `(consumer, pending count)` pairs.
    pub consumers: Vec<(String, u64)>,
}

/// Millisecond TTL for a key expiry.  The server rejects `PX 0`, so
/// anything under a millisecond is refused up front.
pub fn ttl_millis(ttl: Duration) -> Result<u64> {
    match ttl.as_millis() {
        0 => Err(anyhow!("ERR invalid expire time in 'set' command")),
        ms => Ok(u64::try_from(ms).unwrap_or(u64::MAX)),
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Key/list/script capabilities required by the distributed lock.
#[async_trait::async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `value` with `ttl` only if the key is absent.  Returns
    /// `true` if the key was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Pop the head of the list at `key`, waiting up to `timeout` for an
    /// element.  `None` means the timeout elapsed.
    async fn blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>>;

    /// Run `script` atomically with the given keys and arguments.
    async fn run_script(&self, script: &Script, keys: &[String], args: &[String]) -> Result<i64>;
}

/// Append-only log capabilities required by the stream queue.
#[async_trait::async_trait]
pub trait StreamStore: Send + Sync {
    /// Whether `key` currently exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Append one entry with a store-assigned ID and return that ID.
    async fn append_entry(&self, key: &str, fields: &[(String, String)]) -> Result<String>;

    /// Append several entries, returning their IDs in order.
    async fn append_entries(&self, key: &str, entries: &[Vec<(String, String)>]) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(entries.len());
        for fields in entries {
            ids.push(self.append_entry(key, fields).await?);
        }
        Ok(ids)
    }

    /// Remove entries from the log.  Returns the number actually removed.
    async fn delete_entries(&self, key: &str, ids: &[String]) -> Result<u64>;

    /// Create consumer group `group` on the existing log at `key`, starting
    /// after `start_id`.  Returns `false` if the group already existed.
    async fn create_group(&self, key: &str, group: &str, start_id: &str) -> Result<bool>;

    /// Read up to `count` entries for `consumer` in `group` from `offset`
    /// (`>` for never-delivered entries, otherwise an ID into the
    /// consumer's pending list).  `block` only applies to `>` reads.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        key: &str,
        offset: &str,
        count: u64,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>>;

    /// Pending-entries summary for `group`, or `None` if the log or the
    /// group does not exist.
    async fn pending_summary(&self, key: &str, group: &str) -> Result<Option<PendingSummary>>;

    /// Remove `ids` from the group's pending list.  Returns the number acked.
    async fn ack_entries(&self, key: &str, group: &str, ids: &[String]) -> Result<u64>;

    /// Inclusive range scan from `start` to `end`.
    async fn range(&self, key: &str, start: &str, end: &str, limit: Option<u64>) -> Result<Vec<StreamEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_and_short_ids() {
        assert_eq!("1700000000000-3".parse::<StreamId>().unwrap(), StreamId::new(1700000000000, 3));
        assert_eq!("42".parse::<StreamId>().unwrap(), StreamId::new(42, 0));
        assert!("abc-1".parse::<StreamId>().is_err());
        assert!("".parse::<StreamId>().is_err());
    }

    #[test]
    fn ordering_is_ms_then_seq() {
        let a = StreamId::new(5, 9);
        let b = StreamId::new(6, 0);
        let c = StreamId::new(6, 1);
        assert!(a < b && b < c);
        assert_eq!(c.to_string(), "6-1");
    }

    #[test]
    fn range_bounds() {
        assert_eq!(StreamId::parse_bound("-", false).unwrap(), StreamId::MIN);
        assert_eq!(StreamId::parse_bound("+", true).unwrap(), StreamId::MAX);
        assert_eq!(StreamId::parse_bound("7", false).unwrap(), StreamId::new(7, 0));
        assert_eq!(StreamId::parse_bound("7", true).unwrap(), StreamId::new(7, u64::MAX));
        assert_eq!(StreamId::parse_bound("7-2", true).unwrap(), StreamId::new(7, 2));
    }

    #[test]
    fn sub_millisecond_ttls_are_refused() {
        assert!(ttl_millis(Duration::ZERO).is_err());
        assert!(ttl_millis(Duration::from_micros(999)).is_err());
        assert_eq!(ttl_millis(Duration::from_micros(1_500)).unwrap(), 1);
        assert_eq!(ttl_millis(Duration::from_secs(3)).unwrap(), 3_000);
    }

    #[test]
    fn entry_field_lookup() {
        let entry = StreamEntry {
            id: "1-0".into(),
            fields: Some(vec![("message".into(), "hi".into())]),
        };
        assert_eq!(entry.field("message"), Some("hi"));
        assert_eq!(entry.field("other"), None);

        let tombstone = StreamEntry {
            id: "1-0".into(),
            fields: None,
        };
        assert_eq!(tombstone.field("message"), None);
    }
}
