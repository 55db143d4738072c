//! Capability traits shared across pipeline crates.
//!
//! Components hand each other these small interfaces instead of whole
//! structs, which keeps the dependency graph acyclic: adapters and the
//! historical import see only [`EventSink`], never the producer WAL type
//! behind it.

use async_trait::async_trait;

use crate::{EventError, FailedEventRecord, PlaybackEvent, TransactionId};

/// The durable front door of the pipeline.
///
/// Implemented by the producer WAL. `publish` must persist the event before
/// returning; once it returns `Ok`, the pipeline guarantees the event will
/// reach either the analytics store or the failed-events table.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Validate, durably record, and begin publishing one event.
    ///
    /// Returns the transaction id assigned to the event. Transient broker
    /// trouble is not an error here - the WAL retry loop owns it. An error
    /// means the event was NOT accepted and the source should retry.
    async fn publish(&self, event: PlaybackEvent) -> Result<TransactionId, EventError>;
}

/// Sink for events that exhausted their retries in a WAL or a handler.
///
/// Implemented by the analytics store (`failed_events` table); injected into
/// both WALs and the router's poison layer.
#[async_trait]
pub trait FailedEventSink: Send + Sync {
    /// Persist a permanent failed-events row for operator triage.
    async fn record_failure(&self, record: FailedEventRecord) -> anyhow::Result<()>;
}

/// Write barrier over the batched analytics appender.
///
/// Passed to callers that need a deterministic flush (for example a
/// sync-completion report) without handing them the whole appender.
#[async_trait]
pub trait Flusher: Send + Sync {
    /// Returns only after all currently buffered inserts are durable.
    async fn flush(&self) -> anyhow::Result<()>;
}
