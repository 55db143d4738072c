//! Pipeline counters backing the operational `/metrics` surface.
//!
//! Plain atomics, incremented on the hot path and snapshotted on demand.
//! Constructed by the runtime and injected through constructors alongside
//! the health registry.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Per-handler delivery outcome counters.
#[derive(Debug, Default)]
pub struct HandlerCounters {
    /// Deliveries the handler completed
    pub success: AtomicU64,
    /// Deliveries that errored (before retry/poison resolution)
    pub failure: AtomicU64,
    /// Deliveries dropped by the dedup layer
    pub deduplicated: AtomicU64,
    /// Deliveries that went to the dead-letter subject
    pub poisoned: AtomicU64,
}

/// Shared counter registry for the whole pipeline.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    handlers: DashMap<String, HandlerCounters>,
    /// Entries currently pending in the producer WAL
    pub producer_wal_depth: AtomicU64,
    /// Entries currently pending in the consumer WAL
    pub consumer_wal_depth: AtomicU64,
    /// Events flushed to the analytics store
    pub events_appended: AtomicU64,
    /// Appender batch flushes
    pub batches_flushed: AtomicU64,
    /// Records currently retained in the broker stream
    pub stream_records: AtomicU64,
    /// Supervisor-observed service restarts
    pub service_restarts: AtomicU64,
    /// Events promoted to the failed-events table
    pub failed_events: AtomicU64,
}

/// Point-in-time copy of the counters, serializable for the metrics probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Per-handler success/failure/dedup/poison counts
    pub handlers: Vec<HandlerSnapshot>,
    /// Producer WAL depth
    pub producer_wal_depth: u64,
    /// Consumer WAL depth
    pub consumer_wal_depth: u64,
    /// Events appended to the analytics store
    pub events_appended: u64,
    /// Appender batch flushes
    pub batches_flushed: u64,
    /// Broker stream record count
    pub stream_records: u64,
    /// Supervisor restarts
    pub service_restarts: u64,
    /// Failed-event promotions
    pub failed_events: u64,
}

/// Per-handler slice of [`MetricsSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerSnapshot {
    /// Handler / consumer group name
    pub handler: String,
    /// Completed deliveries
    pub success: u64,
    /// Errored deliveries
    pub failure: u64,
    /// Dedup drops
    pub deduplicated: u64,
    /// Dead-lettered deliveries
    pub poisoned: u64,
}

impl PipelineMetrics {
    /// Create a zeroed registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a handler outcome. Creates the handler slot on first use.
    pub fn handler(&self, name: &str) -> dashmap::mapref::one::Ref<'_, String, HandlerCounters> {
        if !self.handlers.contains_key(name) {
            self.handlers
                .entry(name.to_string())
                .or_insert_with(HandlerCounters::default);
        }
        self.handlers.get(name).expect("slot just inserted")
    }

    /// Snapshot every counter with relaxed loads.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut handlers: Vec<HandlerSnapshot> = self
            .handlers
            .iter()
            .map(|entry| HandlerSnapshot {
                handler: entry.key().clone(),
                success: entry.value().success.load(Ordering::Relaxed),
                failure: entry.value().failure.load(Ordering::Relaxed),
                deduplicated: entry.value().deduplicated.load(Ordering::Relaxed),
                poisoned: entry.value().poisoned.load(Ordering::Relaxed),
            })
            .collect();
        handlers.sort_by(|a, b| a.handler.cmp(&b.handler));
        MetricsSnapshot {
            handlers,
            producer_wal_depth: self.producer_wal_depth.load(Ordering::Relaxed),
            consumer_wal_depth: self.consumer_wal_depth.load(Ordering::Relaxed),
            events_appended: self.events_appended.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            stream_records: self.stream_records.load(Ordering::Relaxed),
            service_restarts: self.service_restarts.load(Ordering::Relaxed),
            failed_events: self.failed_events.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_counters_accumulate() {
        let metrics = PipelineMetrics::new();
        metrics
            .handler("analytics")
            .success
            .fetch_add(3, Ordering::Relaxed);
        metrics
            .handler("analytics")
            .failure
            .fetch_add(1, Ordering::Relaxed);
        metrics
            .handler("push")
            .success
            .fetch_add(2, Ordering::Relaxed);

        let snap = metrics.snapshot();
        assert_eq!(snap.handlers.len(), 2);
        let analytics = snap
            .handlers
            .iter()
            .find(|h| h.handler == "analytics")
            .unwrap();
        assert_eq!(analytics.success, 3);
        assert_eq!(analytics.failure, 1);
    }

    #[test]
    fn depth_gauges_move_both_ways() {
        let metrics = PipelineMetrics::new();
        metrics.producer_wal_depth.store(12, Ordering::Relaxed);
        assert_eq!(metrics.snapshot().producer_wal_depth, 12);
        metrics.producer_wal_depth.store(0, Ordering::Relaxed);
        assert_eq!(metrics.snapshot().producer_wal_depth, 0);
    }
}
