#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **medley-broker** – Embedded durable-stream broker for Medley.
//!
//! A single persistent stream captures every subject under `playback.>`.
//! Records are retained by age and bounded on-disk size; consumers attach as
//! named durable groups, each with its own acknowledgement cursor and
//! redelivery counters that survive restarts.
//!
//! The broker is in-process: the stream persists through the same embedded
//! engine as the write-ahead logs, handed in as a [`medley_store::KvProvider`]
//! capability. An external broker would implement the same [`Broker`] trait;
//! the pipeline treats both identically.
//!
//! Failure semantics: a failed publish surfaces to the producer WAL, which
//! owns the retry. Nothing in this crate retries publishes itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use async_trait::async_trait;
use medley_types::StreamSeq;

mod stream;
mod subject;

pub use stream::{DurableStream, StreamConfig};
pub use subject::subject_matches;

//─────────────────────────────
//  Wire types
//─────────────────────────────

/// Headers carried alongside every stream record body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHeaders {
    /// Source-stable event identifier (redelivery dedup key)
    pub event_id: String,
    /// Producer-WAL transaction id (analytics idempotency key)
    pub transaction_id: String,
    /// Cross-source session identifier
    pub correlation_key: String,
    /// Originating adapter tag
    pub source: String,
    /// Originating upstream instance
    pub server_id: String,
}

/// A record as retained in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    /// Position in the stream, monotonic per stream
    pub seq: StreamSeq,
    /// Publish subject, `playback.<source>.<kind>`
    pub subject: String,
    /// Identity headers
    pub headers: RecordHeaders,
    /// JSON body of the canonical event
    pub body: Vec<u8>,
    /// Broker-side receive timestamp, drives age retention
    pub published_at: DateTime<Utc>,
}

/// One message handed to a consumer group subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Stream position; pass back to [`StreamSubscription::ack`]
    pub seq: StreamSeq,
    /// Publish subject
    pub subject: String,
    /// Identity headers
    pub headers: RecordHeaders,
    /// JSON body of the canonical event
    pub body: Vec<u8>,
    /// How many times this record has been delivered to this group
    pub deliveries: u32,
}

//─────────────────────────────
//  Broker contract
//─────────────────────────────

/// Publish/subscribe contract the pipeline programs against.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append one record to the stream and make it durable.
    async fn publish(
        &self,
        subject: &str,
        headers: RecordHeaders,
        body: Vec<u8>,
    ) -> Result<StreamSeq, BrokerError>;

    /// Attach (or re-attach) a named durable consumer group.
    ///
    /// Each group has an independent cursor; within a group with a single
    /// subscriber, records arrive in stream-sequence order. Unacknowledged
    /// deliveries are redelivered after the configured ack wait, up to the
    /// group's MaxDeliver limit.
    async fn subscribe_durable(
        &self,
        group: &str,
        filter: &str,
    ) -> Result<Box<dyn StreamSubscription>, BrokerError>;

    /// Stop the broker: refuse further publishes and subscriptions and make
    /// the retained stream durable. For the embedded stream this is both
    /// the "close connection" and "stop broker" steps of the ordered
    /// teardown; subscriptions already handed out drain what they hold.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A consumer group's live subscription.
#[async_trait]
pub trait StreamSubscription: Send {
    /// Wait for and return the next delivery for this group.
    async fn next(&mut self) -> Result<Delivery, BrokerError>;

    /// Acknowledge a delivery; the record will not be redelivered and the
    /// group's durable cursor advances over it.
    async fn ack(&mut self, seq: StreamSeq) -> Result<(), BrokerError>;
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Broker failures.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The backing store rejected an operation
    #[error("stream storage failure: {0}")]
    Store(#[from] medley_store::StoreError),
    /// A stored record or cursor failed to decode
    #[error("corrupt stream state: {0}")]
    Corrupt(String),
    /// Subject or filter is not valid in the `playback.>` namespace
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
    /// The broker is shutting down
    #[error("broker is closed")]
    Closed,
}
