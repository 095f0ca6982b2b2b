//! In-process store with Redis semantics.
//!
//! [`MemoryStore`] keeps strings, lists and streams in one keyspace behind a
//! single async mutex, so every capability call is atomic exactly like a
//! command (or script) on a real server.  Expiry is applied lazily on access.
//! Blocking calls park on a [`Notify`] that every write wakes, then re-check
//! their condition.
//!
//! The lock scripts are executed natively, keyed by [`Script::name`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::trace;

use super::store::{ttl_millis, LockStore, PendingSummary, Script, StreamEntry, StreamId, StreamStore};

// ---------------------------------------------------------------------------
// Keyspace
// ---------------------------------------------------------------------------

enum Data {
    String(String),
    List(VecDeque<String>),
    Stream(Stream),
}

struct Slot {
    data: Data,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<StreamId, Vec<(String, String)>>,
    last_id: StreamId,
    groups: HashMap<String, Group>,
}

struct Group {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingEntry>,
}

struct PendingEntry {
    consumer: String,
    deliveries: u64,
}

#[derive(Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
}

fn wrong_type() -> anyhow::Error {
    anyhow!("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn no_group(key: &str, group: &str) -> anyhow::Error {
    anyhow!("NOGROUP No such key '{key}' or consumer group '{group}'")
}

fn limit(count: u64) -> usize {
    if count == 0 {
        usize::MAX
    } else {
        count as usize
    }
}

impl Keyspace {
    /// Live slot for `key`, dropping it first if its TTL has passed.
    fn slot(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Instant::now();
        let expired = self
            .slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn string(&mut self, key: &str) -> Result<Option<&str>> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                data: Data::String(value),
                ..
            }) => Ok(Some(value.as_str())),
            Some(_) => Err(wrong_type()),
        }
    }

    fn stream(&mut self, key: &str) -> Result<Option<&mut Stream>> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                data: Data::Stream(stream),
                ..
            }) => Ok(Some(stream)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn pop_front(&mut self, key: &str) -> Result<Option<String>> {
        let (value, now_empty) = match self.slot(key) {
            None => return Ok(None),
            Some(Slot {
                data: Data::List(list),
                ..
            }) => {
                let value = list.pop_front();
                (value, list.is_empty())
            }
            Some(_) => return Err(wrong_type()),
        };
        if now_empty {
            self.slots.remove(key);
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    keyspace: Mutex<Keyspace>,
    changed: Notify,
}

/// Embedded [`LockStore`] + [`StreamStore`].  Clones share the keyspace.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn release_lock(keyspace: &mut Keyspace, keys: &[String], args: &[String]) -> Result<i64> {
        let (lock_key, signal_key) = (arg(keys, 0)?, arg(keys, 1)?);
        let (token, signal_ttl_ms) = (arg(args, 0)?, arg(args, 1)?);
        let signal_ttl: u64 = signal_ttl_ms
            .parse()
            .map_err(|_| anyhow!("ERR value is not an integer or out of range"))?;

        if keyspace.string(lock_key)? != Some(token) {
            return Ok(0);
        }
        keyspace.slots.insert(
            signal_key.to_string(),
            Slot {
                data: Data::List(VecDeque::from(["1".to_string()])),
                expires_at: Some(Instant::now() + Duration::from_millis(signal_ttl)),
            },
        );
        keyspace.slots.remove(lock_key);
        Ok(1)
    }

    fn extend_lock(keyspace: &mut Keyspace, keys: &[String], args: &[String]) -> Result<i64> {
        let lock_key = arg(keys, 0)?;
        let (token, ttl_ms) = (arg(args, 0)?, arg(args, 1)?);
        let ttl: u64 = ttl_ms
            .parse()
            .map_err(|_| anyhow!("ERR value is not an integer or out of range"))?;

        if keyspace.string(lock_key)? != Some(token) {
            return Ok(0);
        }
        if let Some(slot) = keyspace.slot(lock_key) {
            slot.expires_at = Some(Instant::now() + Duration::from_millis(ttl));
        }
        Ok(1)
    }
}

fn arg<'a>(values: &'a [String], index: usize) -> Result<&'a str> {
    values
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("ERR script argument {index} missing"))
}

#[async_trait::async_trait]
impl LockStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let ttl = Duration::from_millis(ttl_millis(ttl)?);
        let mut keyspace = self.inner.keyspace.lock().await;
        if keyspace.slot(key).is_some() {
            return Ok(false);
        }
        keyspace.slots.insert(
            key.to_string(),
            Slot {
                data: Data::String(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let changed = {
                let mut keyspace = self.inner.keyspace.lock().await;
                if let Some(value) = keyspace.pop_front(key)? {
                    return Ok(Some(value));
                }
                // Registered while the keyspace is still locked, so a push
                // that lands before we start waiting is not missed.
                self.inner.changed.notified()
            };
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                trace!(%key, "blocking pop timed out");
                return Ok(None);
            }
        }
    }

    async fn run_script(&self, script: &Script, keys: &[String], args: &[String]) -> Result<i64> {
        let mut keyspace = self.inner.keyspace.lock().await;
        let result = match script.name {
            "release_lock" => Self::release_lock(&mut keyspace, keys, args)?,
            "extend_lock" => Self::extend_lock(&mut keyspace, keys, args)?,
            other => bail!("NOSCRIPT no embedded implementation for script '{other}'"),
        };
        drop(keyspace);
        self.inner.changed.notify_waiters();
        Ok(result)
    }
}

#[async_trait::async_trait]
impl StreamStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.inner.keyspace.lock().await.slot(key).is_some())
    }

    async fn append_entry(&self, key: &str, fields: &[(String, String)]) -> Result<String> {
        let mut keyspace = self.inner.keyspace.lock().await;
        if keyspace.stream(key)?.is_none() {
            keyspace.slots.insert(
                key.to_string(),
                Slot {
                    data: Data::Stream(Stream::default()),
                    expires_at: None,
                },
            );
        }
        let stream = keyspace.stream(key)?.ok_or_else(wrong_type)?;

        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let id = if now > stream.last_id.ms {
            StreamId::new(now, 0)
        } else {
            StreamId::new(stream.last_id.ms, stream.last_id.seq + 1)
        };
        stream.entries.insert(id, fields.to_vec());
        stream.last_id = id;
        drop(keyspace);

        self.inner.changed.notify_waiters();
        Ok(id.to_string())
    }

    async fn delete_entries(&self, key: &str, ids: &[String]) -> Result<u64> {
        let ids = ids
            .iter()
            .map(|id| id.parse::<StreamId>())
            .collect::<Result<Vec<_>>>()?;
        let mut keyspace = self.inner.keyspace.lock().await;
        let Some(stream) = keyspace.stream(key)? else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| stream.entries.remove(*id).is_some())
            .count() as u64)
    }

    async fn create_group(&self, key: &str, group: &str, start_id: &str) -> Result<bool> {
        let mut keyspace = self.inner.keyspace.lock().await;
        let stream = keyspace.stream(key)?.ok_or_else(|| {
            anyhow!("ERR The XGROUP subcommand requires the key to exist")
        })?;
        if stream.groups.contains_key(group) {
            return Ok(false);
        }
        let last_delivered = match start_id {
            "$" => stream.last_id,
            other => StreamId::parse_bound(other, false)?,
        };
        stream.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        key: &str,
        offset: &str,
        count: u64,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>> {
        let history_from = match offset {
            ">" => None,
            id => Some(StreamId::parse_bound(id, false)?),
        };
        let deadline = block.map(|b| Instant::now() + b);

        loop {
            let changed = {
                let mut keyspace = self.inner.keyspace.lock().await;
                let stream = keyspace.stream(key)?.ok_or_else(|| no_group(key, group))?;
                let grp = stream
                    .groups
                    .get_mut(group)
                    .ok_or_else(|| no_group(key, group))?;

                if let Some(from) = history_from {
                    // Re-read this consumer's own pending entries; never blocks.
                    return Ok(grp
                        .pending
                        .range((Excluded(from), Unbounded))
                        .filter(|(_, p)| p.consumer == consumer)
                        .take(limit(count))
                        .map(|(id, _)| StreamEntry {
                            id: id.to_string(),
                            fields: stream.entries.get(id).cloned(),
                        })
                        .collect());
                }

                let fresh: Vec<StreamEntry> = stream
                    .entries
                    .range((Excluded(grp.last_delivered), Unbounded))
                    .take(limit(count))
                    .map(|(id, fields)| StreamEntry {
                        id: id.to_string(),
                        fields: Some(fields.clone()),
                    })
                    .collect();
                if !fresh.is_empty() {
                    for entry in &fresh {
                        let id: StreamId = entry.id.parse()?;
                        let pending = grp.pending.entry(id).or_insert(PendingEntry {
                            consumer: consumer.to_string(),
                            deliveries: 0,
                        });
                        pending.consumer = consumer.to_string();
                        pending.deliveries += 1;
                        grp.last_delivered = id;
                    }
                    return Ok(fresh);
                }
                if deadline.is_none() {
                    return Ok(Vec::new());
                }
                self.inner.changed.notified()
            };

            if let Some(deadline) = deadline {
                if tokio::time::timeout_at(deadline, changed).await.is_err() {
                    return Ok(Vec::new());
                }
            }
        }
    }

    async fn pending_summary(&self, key: &str, group: &str) -> Result<Option<PendingSummary>> {
        let mut keyspace = self.inner.keyspace.lock().await;
        let Some(grp) = keyspace.stream(key)?.and_then(|s| s.groups.get(group)) else {
            return Ok(None);
        };
        let mut consumers: BTreeMap<String, u64> = BTreeMap::new();
        for entry in grp.pending.values() {
            *consumers.entry(entry.consumer.clone()).or_default() += 1;
        }
        Ok(Some(PendingSummary {
            count: grp.pending.len() as u64,
            lowest: grp.pending.keys().next().map(|id| id.to_string()),
            highest: grp.pending.keys().next_back().map(|id| id.to_string()),
            consumers: consumers.into_iter().collect(),
        }))
    }

    async fn ack_entries(&self, key: &str, group: &str, ids: &[String]) -> Result<u64> {
        let ids = ids
            .iter()
            .map(|id| id.parse::<StreamId>())
            .collect::<Result<Vec<_>>>()?;
        let mut keyspace = self.inner.keyspace.lock().await;
        let Some(grp) = keyspace.stream(key)?.and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| grp.pending.remove(*id).is_some())
            .count() as u64)
    }

    async fn range(&self, key: &str, start: &str, end: &str, limit_to: Option<u64>) -> Result<Vec<StreamEntry>> {
        let start = StreamId::parse_bound(start, false)?;
        let end = StreamId::parse_bound(end, true)?;
        let mut keyspace = self.inner.keyspace.lock().await;
        let Some(stream) = keyspace.stream(key)? else {
            return Ok(Vec::new());
        };
        if start > end {
            return Ok(Vec::new());
        }
        Ok(stream
            .entries
            .range((Included(start), Included(end)))
            .take(limit_to.map(limit).unwrap_or(usize::MAX))
            .map(|(id, fields)| StreamEntry {
                id: id.to_string(),
                fields: Some(fields.clone()),
            })
            .collect())
    }
}
