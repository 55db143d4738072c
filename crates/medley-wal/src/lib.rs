#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **medley-wal** – Write-ahead logs for the Medley pipeline.
//!
//! Two logs with one discipline: persist before acknowledging, retry with
//! durable leases, promote to the failed-events table when retries run out.
//!
//! The [`producer::ProducerWal`] sits between the upstream adapters and the
//! broker - no event is acknowledged to an adapter until its entry is on
//! disk, and every pending entry is either republished or promoted on
//! restart.
//!
//! The [`consumer::ConsumerWal`] is the exactly-once bridge between the
//! broker and the analytics store. It splits the hand-off into three
//! independently retryable steps: record the delivery durably (only then is
//! the broker acked), commit to the store under the transaction id, and
//! confirm by deleting the entry. A crash between any two steps is repaired
//! by recovery or the lease-guarded retry loop without loss or duplication.

use std::time::Duration;

pub mod consumer;
mod entries;
mod lease;
pub mod ports;
pub mod producer;

pub use entries::{ConsumerEntry, ConsumerEntryState, ProducerEntry, ProducerEntryState};
pub use lease::LeaseKeeper;

/// Retries are spaced `min(attempts * base, 5 minutes)` apart.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Backoff before the next attempt of an entry that has failed `attempts`
/// times already.
pub fn retry_backoff(attempts: u32, base: Duration) -> Duration {
    base.saturating_mul(attempts.max(1)).min(MAX_BACKOFF)
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failures surfaced by either write-ahead log.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// The WAL has been shut down and accepts no further work
    #[error("write-ahead log is closed")]
    Closed,
    /// The backing store is out of space; the entry was not persisted
    #[error("write-ahead log disk full: {0}")]
    DiskFull(String),
    /// The backing store failed
    #[error("write-ahead log storage failure: {0}")]
    Store(medley_store::StoreError),
    /// An entry or lease failed to decode
    #[error("corrupt write-ahead log entry: {0}")]
    Corrupt(String),
    /// The event payload violated an adapter-boundary invariant
    #[error(transparent)]
    Invariant(#[from] medley_types::EventError),
    /// Broker publish failed; the entry stays pending
    #[error("broker publish failed: {0}")]
    Publish(#[from] medley_broker::BrokerError),
    /// The analytics commit port failed
    #[error("analytics commit failed: {0}")]
    Commit(#[from] ports::CommitError),
    /// The failed-events sink refused a promotion
    #[error("failed-events sink failure: {0}")]
    FailedSink(String),
}

impl From<medley_store::StoreError> for WalError {
    fn from(err: medley_store::StoreError) -> Self {
        match err {
            medley_store::StoreError::Closed => WalError::Closed,
            medley_store::StoreError::DiskFull(detail) => WalError::DiskFull(detail),
            other => WalError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly_then_caps() {
        let base = Duration::from_secs(5);
        assert_eq!(retry_backoff(0, base), Duration::from_secs(5));
        assert_eq!(retry_backoff(1, base), Duration::from_secs(5));
        assert_eq!(retry_backoff(3, base), Duration::from_secs(15));
        assert_eq!(retry_backoff(1000, base), MAX_BACKOFF);
    }
}
