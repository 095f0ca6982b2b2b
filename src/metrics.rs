use std::sync::Arc;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TopicLabels {
    pub topic: String,
}

impl TopicLabels {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the lock and the queue.
pub struct Metrics {
    // -- locks --
    pub lock_acquisitions: Counter,
    pub lock_waits: Counter,
    pub lock_timeouts: Counter,
    pub lock_releases: Counter,
    pub lock_release_rejections: Counter,
    pub lock_acquire_duration_seconds: Histogram,

    // -- queue --
    pub queue_produced: Family<TopicLabels, Counter>,
    pub queue_delivered: Family<TopicLabels, Counter>,
    pub queue_acked: Family<TopicLabels, Counter>,
    pub queue_deleted: Family<TopicLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let lock_acquisitions = Counter::default();
        registry.register(
            "rediskit_lock_acquisitions",
            "Distributed lock acquisitions",
            lock_acquisitions.clone(),
        );

        let lock_waits = Counter::default();
        registry.register(
            "rediskit_lock_waits",
            "Blocking waits on a lock release signal",
            lock_waits.clone(),
        );

        let lock_timeouts = Counter::default();
        registry.register(
            "rediskit_lock_timeouts",
            "Blocking acquisitions that gave up without the lock",
            lock_timeouts.clone(),
        );

        let lock_releases = Counter::default();
        registry.register(
            "rediskit_lock_releases",
            "Locks released by their owner",
            lock_releases.clone(),
        );

        let lock_release_rejections = Counter::default();
        registry.register(
            "rediskit_lock_release_rejections",
            "Release calls ignored because the caller did not hold the lock",
            lock_release_rejections.clone(),
        );

        let lock_acquire_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 14));
        registry.register(
            "rediskit_lock_acquire_duration_seconds",
            "Time spent in acquire, including blocking waits",
            lock_acquire_duration_seconds.clone(),
        );

        let queue_produced = Family::<TopicLabels, Counter>::default();
        registry.register(
            "rediskit_queue_produced",
            "Messages appended to a topic",
            queue_produced.clone(),
        );

        let queue_delivered = Family::<TopicLabels, Counter>::default();
        registry.register(
            "rediskit_queue_delivered",
            "Messages handed to consumers, including redeliveries",
            queue_delivered.clone(),
        );

        let queue_acked = Family::<TopicLabels, Counter>::default();
        registry.register(
            "rediskit_queue_acked",
            "Messages acknowledged by a consumer group",
            queue_acked.clone(),
        );

        let queue_deleted = Family::<TopicLabels, Counter>::default();
        registry.register(
            "rediskit_queue_deleted",
            "Messages physically removed from a topic",
            queue_deleted.clone(),
        );

        Self {
            lock_acquisitions,
            lock_waits,
            lock_timeouts,
            lock_releases,
            lock_release_rejections,
            lock_acquire_duration_seconds,
            queue_produced,
            queue_delivered,
            queue_acked,
            queue_deleted,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the registry and its metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_registered_metrics() {
        let registry = MetricsRegistry::new();
        registry.metrics.lock_acquisitions.inc();
        registry
            .metrics
            .queue_produced
            .get_or_create(&TopicLabels::new("orders"))
            .inc_by(2);

        let text = registry.encode().unwrap();
        assert!(text.contains("rediskit_lock_acquisitions_total 1"));
        assert!(text.contains("rediskit_queue_produced_total{topic=\"orders\"} 2"));
    }
}
