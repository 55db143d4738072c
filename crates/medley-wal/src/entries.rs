//! On-disk entry shapes and key layout.
//!
//! Keys carry short prefixes by kind: `pwal:<txid>`, `cwal:<entry_id>`,
//! `lease:<entry_id>`. Values are MessagePack-encoded entries owned by the
//! component that wrote them until deletion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::WalError;

pub(crate) const PRODUCER_PREFIX: &str = "pwal:";
pub(crate) const CONSUMER_PREFIX: &str = "cwal:";

pub(crate) fn producer_key(transaction_id: Uuid) -> Vec<u8> {
    format!("{PRODUCER_PREFIX}{transaction_id}").into_bytes()
}

pub(crate) fn consumer_key(entry_id: Uuid) -> Vec<u8> {
    format!("{CONSUMER_PREFIX}{entry_id}").into_bytes()
}

//─────────────────────────────
//  Producer WAL entry
//─────────────────────────────

/// Lifecycle of a producer WAL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerEntryState {
    /// Awaiting broker acknowledgement
    Pending,
    /// Acked by the broker; the entry is deleted immediately after, so this
    /// state is only ever observed transiently
    Published,
}

/// One outbound event recorded before broker publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerEntry {
    /// Identity assigned at append time, never mutated
    pub transaction_id: Uuid,
    /// Broker subject the payload publishes under
    pub subject: String,
    /// JSON body of the canonical event (with `transaction_id` set)
    pub payload: Vec<u8>,
    /// Append timestamp
    pub enqueued_at: DateTime<Utc>,
    /// Publish attempts so far
    pub attempts: u32,
    /// Most recent publish error
    pub last_error: Option<String>,
    /// Informational copy of the current lease, if any
    pub lease_holder: Option<String>,
    /// Informational copy of the current lease expiry
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Entry state
    pub state: ProducerEntryState,
}

//─────────────────────────────
//  Consumer WAL entry
//─────────────────────────────

/// Lifecycle of a consumer WAL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerEntryState {
    /// Awaiting analytics commit
    Pending,
    /// Last attempt errored; the retry loop owns it now
    Failed,
}

/// One delivered message recorded before the analytics insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerEntry {
    /// Fresh identity for this delivery record
    pub entry_id: Uuid,
    /// Transaction id carried from the producer side
    pub transaction_id: Uuid,
    /// JSON body of the canonical event
    pub event_payload: Vec<u8>,
    /// Receipt timestamp
    pub created_at: DateTime<Utc>,
    /// Commit attempts so far
    pub attempts: u32,
    /// When the last commit attempt ran
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Most recent commit error
    pub last_error: Option<String>,
    /// Informational copy of the current lease, if any
    pub lease_holder: Option<String>,
    /// Informational copy of the current lease expiry
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Entry state
    pub state: ConsumerEntryState,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WalError> {
    rmp_serde::to_vec_named(value).map_err(|error| WalError::Corrupt(error.to_string()))
}

pub(crate) fn decode<T: for<'de> Deserialize<'de>>(key: &[u8], bytes: &[u8]) -> Result<T, WalError> {
    rmp_serde::from_slice(bytes).map_err(|error| {
        WalError::Corrupt(format!(
            "entry {}: {error}",
            String::from_utf8_lossy(key)
        ))
    })
}
