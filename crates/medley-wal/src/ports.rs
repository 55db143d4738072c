//! Outbound capability ports of the write-ahead logs.
//!
//! The WALs never see the analytics crate directly; the runtime wires these
//! small interfaces at assembly time, which keeps the dependency graph
//! acyclic and the WALs testable against in-process fakes.

use async_trait::async_trait;

use medley_types::{PlaybackEvent, TransactionId};

pub use medley_types::traits::FailedEventSink;

/// Outcome of an idempotent analytics insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A new row was written
    Inserted,
    /// The transaction id (or source/event id pair) was already present;
    /// treated as success everywhere
    AlreadyPresent,
}

/// Failures of the analytics commit path.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// Transient: store unreachable, pool exhausted, batch failed
    #[error("analytics store unavailable: {0}")]
    Unavailable(String),
    /// Permanent: the payload can never be inserted (invariant violation)
    #[error("analytics store rejected the event: {0}")]
    Rejected(String),
}

impl CommitError {
    /// Permanent rejections skip further retries and promote immediately.
    pub fn is_permanent(&self) -> bool {
        matches!(self, CommitError::Rejected(_))
    }
}

/// Idempotent insert port into the analytics store.
///
/// Two implementations exist: the batched appender (live path, amortizes
/// flushes) and the direct store (recovery and retry paths, one row at a
/// time).
#[async_trait]
pub trait EventCommitter: Send + Sync {
    /// Insert one event keyed by its transaction id. Duplicate transaction
    /// ids and duplicate (source, event id) pairs report
    /// [`CommitOutcome::AlreadyPresent`].
    async fn commit_event(&self, event: &PlaybackEvent) -> Result<CommitOutcome, CommitError>;

    /// Is this transaction id already durable in the store?
    async fn transaction_exists(&self, transaction_id: TransactionId)
        -> Result<bool, CommitError>;
}
