#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **medley-analytics** – Columnar analytics store and batched appender.
//!
//! The store persists playback events through sqlx with two idempotency
//! keys: a `UNIQUE` transaction id (producer-WAL identity) and a `UNIQUE`
//! `(source, event_id)` pair (cross-restart identity). Inserts use
//! `INSERT OR IGNORE`, so replays and redeliveries collapse into one row.
//!
//! The [`EventAppender`] buffers inserts and flushes them in one transaction
//! on the first of: batch full, flush interval, or an explicit
//! [`medley_types::traits::Flusher::flush`] barrier. A failed flush fails
//! the whole batch; the consumer WAL retries each entry individually.

mod appender;
mod store;

pub use appender::{AppenderConfig, EventAppender};
pub use store::{AlertRow, AnalyticsStore, FailedEventRow, ImportProgress};

/// Store-level failures.
#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    /// Database failure (pool, I/O, constraint machinery)
    #[error("analytics database failure: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored payload failed to decode back into the canonical event
    #[error("corrupt stored payload: {0}")]
    Corrupt(String),
    /// Requeue target does not exist or is not requeueable
    #[error("failed event {0} not found or already requeued")]
    NotRequeueable(i64),
    /// The appender has shut down
    #[error("appender is closed")]
    AppenderClosed,
}
