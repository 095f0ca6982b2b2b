//! Durable consumer-group queue over an append-only stream.
//!
//! Every message is one stream entry with a single `message` field.
//! Delivery (`consume`) and acknowledgement (`ack`) are separate steps, so a
//! consumer that dies between them leaves the entry in its group's pending
//! list, where `get_pending` finds it again: at-least-once delivery.
//! `ack` only touches the group; `delete` removes the entry from the log for
//! every group.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use serde::Serialize;
use tracing::{debug, info, trace};

use super::store::{PendingSummary, StreamEntry, StreamId, StreamStore};
use crate::metrics::{Metrics, MetricsRegistry, TopicLabels};

/// Name of the single field each entry carries.
pub const MESSAGE_FIELD: &str = "message";

/// Where a group read starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offset {
    /// Entries never delivered to this group.
    Unread,
    /// This consumer's delivered-but-unacknowledged entries, from the first.
    Unconfirmed,
    /// This consumer's pending entries after the given ID.
    After(String),
}

impl Offset {
    pub fn as_str(&self) -> &str {
        match self {
            Offset::Unread => ">",
            Offset::Unconfirmed => "0",
            Offset::After(id) => id,
        }
    }
}

/// A delivered message.  `data` is `None` for an entry that was deleted
/// from the log after it was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: String,
    pub data: Option<String>,
}

impl From<StreamEntry> for Message {
    fn from(entry: StreamEntry) -> Self {
        let data = entry.field(MESSAGE_FIELD).map(str::to_string);
        Self { id: entry.id, data }
    }
}

#[derive(Debug, Clone)]
struct Membership {
    group: String,
    consumer: String,
}

/// Handle to one topic, optionally bound to a consumer group and consumer
/// name.
pub struct StreamQueue {
    store: Arc<dyn StreamStore>,
    topic: String,
    membership: Option<Membership>,
    metrics: Option<MetricsRegistry>,
}

impl StreamQueue {
    /// A producer-side handle.  Nothing is written until the first message.
    pub fn producer(store: Arc<dyn StreamStore>, topic: impl Into<String>) -> Self {
        Self {
            store,
            topic: topic.into(),
            membership: None,
            metrics: None,
        }
    }

    /// A consumer-side handle.  The topic and the group are created if they
    /// do not exist yet; opening an already initialised topic/group is a
    /// no-op.
    pub async fn open(
        store: Arc<dyn StreamStore>,
        topic: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self> {
        let queue = Self {
            store,
            topic: topic.into(),
            membership: Some(Membership {
                group: group.into(),
                consumer: consumer.into(),
            }),
            metrics: None,
        };
        queue.init_topic().await?;
        queue.init_group().await?;
        Ok(queue)
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.group.as_str())
    }

    pub fn consumer(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.consumer.as_str())
    }

    fn membership(&self) -> Result<&Membership> {
        self.membership
            .as_ref()
            .ok_or_else(|| anyhow!("queue '{}' was opened without a consumer group", self.topic))
    }

    fn count(&self, pick: impl Fn(&Metrics) -> &Family<TopicLabels, Counter>, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(registry) = &self.metrics {
            pick(&registry.metrics)
                .get_or_create(&TopicLabels::new(&self.topic))
                .inc_by(n);
        }
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// Make sure the topic's log exists.
    ///
    /// A stream cannot be created empty, so a throwaway entry is appended and
    /// immediately deleted; the (now empty) stream stays behind.
    pub async fn init_topic(&self) -> Result<()> {
        if self.store.exists(&self.topic).await? {
            return Ok(());
        }
        let sentinel = vec![(MESSAGE_FIELD.to_string(), String::new())];
        let id = self.store.append_entry(&self.topic, &sentinel).await?;
        self.store.delete_entries(&self.topic, &[id]).await?;
        info!(topic = %self.topic, "topic created");
        Ok(())
    }

    /// Make sure the consumer group exists, reading from the start of the log.
    pub async fn init_group(&self) -> Result<()> {
        let Membership { group, .. } = self.membership()?;
        if self.store.pending_summary(&self.topic, group).await?.is_some() {
            return Ok(());
        }
        let created = self.store.create_group(&self.topic, group, "0").await?;
        if created {
            info!(topic = %self.topic, %group, "consumer group created");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Append one message and return its assigned ID.
    pub async fn produce(&self, payload: &str) -> Result<String> {
        let fields = vec![(MESSAGE_FIELD.to_string(), payload.to_string())];
        let id = self.store.append_entry(&self.topic, &fields).await?;
        self.count(|m| &m.queue_produced, 1);
        trace!(topic = %self.topic, %id, "produced");
        Ok(id)
    }

    /// Append several messages in order and return their IDs.
    pub async fn produce_batch<S: AsRef<str>>(&self, payloads: &[S]) -> Result<Vec<String>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let entries: Vec<Vec<(String, String)>> = payloads
            .iter()
            .map(|p| vec![(MESSAGE_FIELD.to_string(), p.as_ref().to_string())])
            .collect();
        let ids = self.store.append_entries(&self.topic, &entries).await?;
        self.count(|m| &m.queue_produced, ids.len() as u64);
        debug!(topic = %self.topic, count = ids.len(), "produced batch");
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Consumer side
    // -----------------------------------------------------------------------

    /// Read up to `count` messages for this consumer starting at `offset`.
    ///
    /// `block` only applies to [`Offset::Unread`] reads; a zero duration is
    /// treated as "do not block".  An empty result is a normal outcome.
    pub async fn consume(&self, count: u64, block: Option<Duration>, offset: Offset) -> Result<Vec<Message>> {
        let Membership { group, consumer } = self.membership()?;
        let block = match offset {
            Offset::Unread => block.filter(|b| !b.is_zero()),
            _ => None,
        };
        let entries = self
            .store
            .read_group(group, consumer, &self.topic, offset.as_str(), count, block)
            .await?;
        let messages: Vec<Message> = entries.into_iter().map(Message::from).collect();

        self.count(|m| &m.queue_delivered, messages.len() as u64);
        debug!(
            topic = %self.topic,
            %group,
            %consumer,
            offset = offset.as_str(),
            delivered = messages.len(),
            "consume"
        );
        Ok(messages)
    }

    /// Re-read this consumer's delivered-but-unacknowledged messages from the
    /// oldest one.  Never blocks.
    pub async fn get_pending(&self, count: u64) -> Result<Vec<Message>> {
        self.consume(count, None, Offset::Unconfirmed).await
    }

    /// Remove `ids` from the group's pending list.  The log is untouched.
    pub async fn ack(&self, ids: &[String]) -> Result<u64> {
        let Membership { group, .. } = self.membership()?;
        if ids.is_empty() {
            return Ok(0);
        }
        let acked = self.store.ack_entries(&self.topic, group, ids).await?;
        self.count(|m| &m.queue_acked, acked);
        debug!(topic = %self.topic, %group, requested = ids.len(), acked, "ack");
        Ok(acked)
    }

    /// Summary of the group's pending list.
    pub async fn pending_summary(&self) -> Result<Option<PendingSummary>> {
        let Membership { group, .. } = self.membership()?;
        self.store.pending_summary(&self.topic, group).await
    }

    // -----------------------------------------------------------------------
    // Log maintenance
    // -----------------------------------------------------------------------

    /// Physically remove entries from the log, for every group.  Unknown IDs
    /// are ignored.
    pub async fn delete(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.store.delete_entries(&self.topic, ids).await?;
        self.count(|m| &m.queue_deleted, removed);
        debug!(topic = %self.topic, requested = ids.len(), removed, "delete");
        Ok(removed)
    }

    /// Look up the message with `id`.
    ///
    /// Scans from `id` for a single entry.  `None` if nothing exists at or
    /// after `id`; a tombstone (`data: None`) if the first entry found is a
    /// later one, meaning `id` itself is gone.
    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let Some(entry) = self
            .store
            .range(&self.topic, id, "+", Some(1))
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };

        if same_id(&entry.id, id) {
            Ok(Some(Message::from(entry)))
        } else {
            trace!(topic = %self.topic, %id, next = %entry.id, "message deleted");
            Ok(Some(Message {
                id: id.to_string(),
                data: None,
            }))
        }
    }
}

/// `<ms>` and `<ms>-0` name the same entry.
fn same_id(found: &str, requested: &str) -> bool {
    match (found.parse::<StreamId>(), requested.parse::<StreamId>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => found == requested,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryStore;

    async fn open(store: &MemoryStore, group: &str, consumer: &str) -> StreamQueue {
        StreamQueue::open(Arc::new(store.clone()), "orders", group, consumer)
            .await
            .unwrap()
    }

    fn ids(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.id.clone()).collect()
    }

    #[test]
    fn offsets_map_to_stream_ids() {
        assert_eq!(Offset::Unread.as_str(), ">");
        assert_eq!(Offset::Unconfirmed.as_str(), "0");
        assert_eq!(Offset::After("5-1".into()).as_str(), "5-1");
    }

    #[test]
    fn message_serialises_with_underscore_id() {
        let json = serde_json::to_string(&Message {
            id: "1-0".into(),
            data: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"_id":"1-0","data":null}"#);
    }

    #[test]
    fn short_and_full_ids_compare_equal() {
        assert!(same_id("1700-0", "1700"));
        assert!(!same_id("1700-1", "1700"));
    }

    #[tokio::test]
    async fn consume_preserves_produce_order() {
        let store = MemoryStore::new();
        let queue = open(&store, "billing", "worker-1").await;

        for payload in ["m1", "m2", "m3"] {
            queue.produce(payload).await.unwrap();
        }
        let messages = queue.consume(3, None, Offset::Unread).await.unwrap();

        let payloads: Vec<_> = messages.iter().map(|m| m.data.as_deref()).collect();
        assert_eq!(payloads, vec![Some("m1"), Some("m2"), Some("m3")]);
        let parsed: Vec<StreamId> = messages.iter().map(|m| m.id.parse().unwrap()).collect();
        assert!(parsed.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn unacked_messages_are_redelivered_until_acked() {
        let store = MemoryStore::new();
        let queue = open(&store, "billing", "worker-1").await;
        queue.produce("x").await.unwrap();

        let delivered = queue.consume(1, None, Offset::Unread).await.unwrap();
        assert_eq!(delivered.len(), 1);
        // Nothing new for this group.
        assert!(queue.consume(1, None, Offset::Unread).await.unwrap().is_empty());

        // Same consumer identity after a restart.
        let restarted = open(&store, "billing", "worker-1").await;
        let pending = restarted.get_pending(10).await.unwrap();
        assert_eq!(pending, delivered);

        assert_eq!(restarted.ack(&ids(&delivered)).await.unwrap(), 1);
        assert!(restarted.get_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_is_per_consumer() {
        let store = MemoryStore::new();
        let a = open(&store, "billing", "a").await;
        let b = open(&store, "billing", "b").await;
        a.produce("1").await.unwrap();
        a.produce("2").await.unwrap();

        assert_eq!(a.consume(1, None, Offset::Unread).await.unwrap().len(), 1);
        assert_eq!(b.consume(1, None, Offset::Unread).await.unwrap().len(), 1);

        let a_pending = a.get_pending(10).await.unwrap();
        let b_pending = b.get_pending(10).await.unwrap();
        assert_eq!(a_pending.len(), 1);
        assert_eq!(b_pending.len(), 1);
        assert_ne!(a_pending[0].id, b_pending[0].id);

        let summary = a.pending_summary().await.unwrap().unwrap();
        assert_eq!(summary.count, 2);
    }

    #[tokio::test]
    async fn ack_keeps_entry_in_log() {
        let store = MemoryStore::new();
        let queue = open(&store, "billing", "worker-1").await;
        let id = queue.produce("keep me").await.unwrap();

        queue.consume(1, None, Offset::Unread).await.unwrap();
        queue.ack(&[id.clone()]).await.unwrap();

        let message = queue.get_message(&id).await.unwrap().unwrap();
        assert_eq!(message.data.as_deref(), Some("keep me"));
    }

    #[tokio::test]
    async fn groups_read_independently() {
        let store = MemoryStore::new();
        let billing = open(&store, "billing", "w").await;
        let audit = open(&store, "audit", "w").await;
        billing.produce("shared").await.unwrap();

        let first = billing.consume(10, None, Offset::Unread).await.unwrap();
        let second = audit.consume(10, None, Offset::Unread).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn deleted_message_reads_as_tombstone() {
        let store = MemoryStore::new();
        let queue = open(&store, "billing", "worker-1").await;

        let id = queue.produce("hello").await.unwrap();
        queue.produce("later").await.unwrap();
        assert_eq!(queue.delete(&[id.clone()]).await.unwrap(), 1);

        let message = queue.get_message(&id).await.unwrap().unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.data, None);
    }

    #[tokio::test]
    async fn deleted_last_message_reads_as_none() {
        let store = MemoryStore::new();
        let queue = open(&store, "billing", "worker-1").await;

        let id = queue.produce("hello").await.unwrap();
        queue.delete(&[id.clone()]).await.unwrap();

        assert_eq!(queue.get_message(&id).await.unwrap(), None);
        // Deleting again is not an error.
        assert_eq!(queue.delete(&[id]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_entry_deleted_from_log_has_null_data() {
        let store = MemoryStore::new();
        let queue = open(&store, "billing", "worker-1").await;
        let id = queue.produce("gone soon").await.unwrap();

        queue.consume(1, None, Offset::Unread).await.unwrap();
        queue.delete(&[id.clone()]).await.unwrap();

        let pending = queue.get_pending(10).await.unwrap();
        assert_eq!(pending, vec![Message { id, data: None }]);
    }

    #[tokio::test]
    async fn reopening_never_duplicates_sentinel() {
        let store = MemoryStore::new();
        let shared: Arc<dyn StreamStore> = Arc::new(store.clone());

        open(&store, "billing", "worker-1").await;
        open(&store, "billing", "worker-1").await;
        let queue = open(&store, "billing", "worker-2").await;

        assert!(shared.exists("orders").await.unwrap());
        assert!(shared.range("orders", "-", "+", None).await.unwrap().is_empty());
        assert!(queue.consume(10, None, Offset::Unread).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn group_created_on_existing_topic_sees_backlog() {
        let store = MemoryStore::new();
        let producer = StreamQueue::producer(Arc::new(store.clone()), "orders");
        producer.produce_batch(&["a", "b"]).await.unwrap();

        let queue = open(&store, "late", "worker-1").await;
        let messages = queue.consume(10, None, Offset::Unread).await.unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn blocking_consume_returns_empty_after_window() {
        let store = MemoryStore::new();
        let queue = open(&store, "billing", "worker-1").await;

        let started = std::time::Instant::now();
        let messages = queue
            .consume(1, Some(Duration::from_millis(200)), Offset::Unread)
            .await
            .unwrap();
        assert!(messages.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(180));
    }

    #[tokio::test]
    async fn blocking_consume_wakes_on_produce() {
        let store = MemoryStore::new();
        let queue = open(&store, "billing", "worker-1").await;
        let producer = StreamQueue::producer(Arc::new(store.clone()), "orders");

        let started = std::time::Instant::now();
        let reader = tokio::spawn(async move {
            queue
                .consume(1, Some(Duration::from_secs(5)), Offset::Unread)
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        producer.produce("wake").await.unwrap();

        let messages = reader.await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data.as_deref(), Some("wake"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn pending_read_ignores_block() {
        let store = MemoryStore::new();
        let queue = open(&store, "billing", "worker-1").await;

        let started = std::time::Instant::now();
        let messages = queue
            .consume(1, Some(Duration::from_secs(5)), Offset::Unconfirmed)
            .await
            .unwrap();
        assert!(messages.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn pending_read_after_id_skips_earlier_entries() {
        let store = MemoryStore::new();
        let queue = open(&store, "billing", "worker-1").await;
        let batch = queue.produce_batch(&["a", "b", "c"]).await.unwrap();
        queue.consume(3, None, Offset::Unread).await.unwrap();

        let rest = queue
            .consume(10, None, Offset::After(batch[0].clone()))
            .await
            .unwrap();
        assert_eq!(ids(&rest), batch[1..].to_vec());
    }

    #[tokio::test]
    async fn producer_handle_cannot_consume() {
        let store = MemoryStore::new();
        let producer = StreamQueue::producer(Arc::new(store.clone()), "orders");
        assert!(producer.consume(1, None, Offset::Unread).await.is_err());
        assert!(producer.ack(&["1-0".to_string()]).await.is_err());
        assert!(producer.init_group().await.is_err());
    }

    #[tokio::test]
    async fn empty_id_lists_are_noops() {
        let store = MemoryStore::new();
        let queue = open(&store, "billing", "worker-1").await;
        assert_eq!(queue.ack(&[]).await.unwrap(), 0);
        assert_eq!(queue.delete(&[]).await.unwrap(), 0);
        assert!(queue.produce_batch::<&str>(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn metrics_count_queue_traffic() {
        let store = MemoryStore::new();
        let registry = MetricsRegistry::new();
        let queue = open(&store, "billing", "worker-1")
            .await
            .with_metrics(registry.clone());

        let produced = queue.produce_batch(&["a", "b"]).await.unwrap();
        queue.consume(10, None, Offset::Unread).await.unwrap();
        queue.ack(&produced[..1]).await.unwrap();
        queue.delete(&produced).await.unwrap();

        let labels = TopicLabels::new("orders");
        let m = &registry.metrics;
        assert_eq!(m.queue_produced.get_or_create(&labels).get(), 2);
        assert_eq!(m.queue_delivered.get_or_create(&labels).get(), 2);
        assert_eq!(m.queue_acked.get_or_create(&labels).get(), 1);
        assert_eq!(m.queue_deleted.get_or_create(&labels).get(), 2);
    }
}
