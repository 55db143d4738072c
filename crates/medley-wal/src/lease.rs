//! Durable leasing over WAL entries.
//!
//! A lease is a persisted, time-bounded claim under `lease:<entry_id>`.
//! Claims go through compare-and-swap, so no two workers ever hold the same
//! entry at once; a crash mid-hold simply lets the lease expire, after which
//! any worker (including this process after restart) may reclaim it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use medley_store::KvStore;
use uuid::Uuid;

use crate::entries::{decode, encode};
use crate::WalError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// Claims and releases durable leases for one WAL's entries.
#[derive(Clone)]
pub struct LeaseKeeper {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl LeaseKeeper {
    /// Lease keys live in the same keyspace as the entries they guard.
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(entry_id: Uuid) -> Vec<u8> {
        format!("lease:{entry_id}").into_bytes()
    }

    /// Try to claim an entry for `holder`. Returns `false` when another
    /// holder's unexpired lease is in place, or when a concurrent claim won
    /// the swap. Re-claiming one's own lease extends it.
    pub async fn try_claim(&self, entry_id: Uuid, holder: &str) -> Result<bool, WalError> {
        let key = Self::key(entry_id);
        let current = self.store.get(&key).await?;
        if let Some(bytes) = &current {
            let lease: Lease = decode(&key, bytes)?;
            if lease.holder != holder && lease.expires_at > Utc::now() {
                return Ok(false);
            }
        }
        let next = Lease {
            holder: holder.to_string(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::seconds(60)),
        };
        let swapped = self
            .store
            .compare_and_swap(&key, current.as_deref(), Some(&encode(&next)?))
            .await?;
        Ok(swapped)
    }

    /// Release a lease we hold. A missing lease means someone else finished
    /// the entry; that is success, not an error.
    pub async fn release(&self, entry_id: Uuid, holder: &str) -> Result<(), WalError> {
        let key = Self::key(entry_id);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(());
        };
        let lease: Lease = decode(&key, &bytes)?;
        if lease.holder != holder {
            return Ok(());
        }
        // A lost swap means the lease changed hands; leave it alone.
        let _ = self
            .store
            .compare_and_swap(&key, Some(&bytes), None)
            .await?;
        Ok(())
    }

    /// Drop the lease record entirely (entry is settled).
    pub async fn clear(&self, entry_id: Uuid) -> Result<(), WalError> {
        self.store.remove(&Self::key(entry_id)).await?;
        Ok(())
    }

    /// Expiry a lease claimed now would carry; mirrored into entry records
    /// for operator triage.
    pub fn current_expiry(&self) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::seconds(60))
    }
}
