#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **medley-store** – Embedded key-value storage abstraction for Medley.
//!
//! Both write-ahead logs and the broker stream persist through the same
//! small [`KvStore`] contract: prefixed keys, atomic compare-and-swap for
//! durable leases, and an explicit flush for the durability boundaries.
//! The sled driver is the production engine; the in-memory driver backs
//! tests that do not need a disk.
//!
//! Key prefixes by kind: `pwal:<txid>`, `cwal:<entry_id>`, `lease:<entry_id>`.
//! Values are serialized entries owned by the component that wrote them.

use std::sync::Arc;

use async_trait::async_trait;

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::{SledProvider, SledStore};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failures surfaced by a storage driver.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store has been closed and will accept no further writes
    #[error("store is closed")]
    Closed,
    /// The underlying engine reported an I/O failure
    #[error("storage I/O failure: {0}")]
    Io(String),
    /// The disk is full; the write was not persisted
    #[error("storage is out of space: {0}")]
    DiskFull(String),
    /// Stored bytes could not be decoded
    #[error("corrupt record under key {key}: {detail}")]
    Corrupt {
        /// Key whose value failed to decode
        key: String,
        /// Decoder error text
        detail: String,
    },
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(ref io) if io.raw_os_error() == Some(28) => {
                StoreError::DiskFull(err.to_string())
            }
            other => StoreError::Io(other.to_string()),
        }
    }
}

//─────────────────────────────
//  Store contract
//─────────────────────────────

/// Minimal durable key-value contract shared by the WALs and the broker.
///
/// Writes become durable at the next [`KvStore::flush`]; callers that need a
/// synchronous durability boundary (WAL appends) flush before acknowledging.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Insert or replace a value.
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Fetch a value.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn remove(&self, key: &[u8]) -> Result<(), StoreError>;

    /// All pairs whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Up to `limit` pairs with key >= `start`, in key order.
    async fn scan_from(
        &self,
        start: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Atomically replace `old` with `new`. `None` for `old` means the key
    /// must be absent; `None` for `new` deletes it. Returns `false` when the
    /// current value did not match `old`.
    async fn compare_and_swap(
        &self,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, StoreError>;

    /// Number of keys under a prefix. Used for depth gauges.
    async fn count_prefix(&self, prefix: &[u8]) -> Result<u64, StoreError>;

    /// Make all prior writes durable.
    async fn flush(&self) -> Result<(), StoreError>;

    /// Run engine-level log compaction / space reclamation.
    async fn compact(&self) -> Result<(), StoreError>;
}

//─────────────────────────────
//  Provider capability
//─────────────────────────────

/// Hands out namespaced [`KvStore`] handles over one underlying engine.
///
/// Passing this capability instead of the engine itself keeps the broker and
/// the historical import decoupled from each other while they share a
/// database directory.
pub trait KvProvider: Send + Sync {
    /// Open (or create) the named keyspace.
    fn keyspace(&self, name: &str) -> Result<Arc<dyn KvStore>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise_store(store: &dyn KvStore) {
        store.put(b"pwal:a", b"1").await.unwrap();
        store.put(b"pwal:b", b"2").await.unwrap();
        store.put(b"cwal:c", b"3").await.unwrap();

        assert_eq!(store.get(b"pwal:a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"missing").await.unwrap(), None);
        assert_eq!(store.count_prefix(b"pwal:").await.unwrap(), 2);

        let scanned = store.scan_prefix(b"pwal:").await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, b"pwal:a".to_vec());

        let ranged = store.scan_from(b"pwal:b", 10).await.unwrap();
        assert_eq!(ranged[0].0, b"pwal:b".to_vec());
        assert_eq!(store.scan_from(b"pwal:b", 0).await.unwrap().len(), 0);

        store.remove(b"pwal:a").await.unwrap();
        assert_eq!(store.get(b"pwal:a").await.unwrap(), None);
        // Removing again is fine.
        store.remove(b"pwal:a").await.unwrap();
    }

    async fn exercise_cas(store: &dyn KvStore) {
        // Create-if-absent
        assert!(store
            .compare_and_swap(b"lease:x", None, Some(b"holder-1"))
            .await
            .unwrap());
        // Second create must fail
        assert!(!store
            .compare_and_swap(b"lease:x", None, Some(b"holder-2"))
            .await
            .unwrap());
        // Swap with the right witness succeeds
        assert!(store
            .compare_and_swap(b"lease:x", Some(b"holder-1"), Some(b"holder-2"))
            .await
            .unwrap());
        // Delete through CAS
        assert!(store
            .compare_and_swap(b"lease:x", Some(b"holder-2"), None)
            .await
            .unwrap());
        assert_eq!(store.get(b"lease:x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_store_contract() {
        let store = MemoryStore::new();
        exercise_store(&store).await;
        exercise_cas(&store).await;
    }

    #[tokio::test]
    async fn sled_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SledProvider::open(dir.path()).unwrap();
        let store = provider.keyspace("wal").unwrap();
        exercise_store(store.as_ref()).await;
        exercise_cas(store.as_ref()).await;
        store.flush().await.unwrap();
    }

    #[tokio::test]
    async fn sled_keyspaces_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SledProvider::open(dir.path()).unwrap();
        let a = provider.keyspace("a").unwrap();
        let b = provider.keyspace("b").unwrap();
        a.put(b"k", b"va").await.unwrap();
        b.put(b"k", b"vb").await.unwrap();
        assert_eq!(a.get(b"k").await.unwrap(), Some(b"va".to_vec()));
        assert_eq!(b.get(b"k").await.unwrap(), Some(b"vb".to_vec()));
    }

    #[tokio::test]
    async fn sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let provider = SledProvider::open(dir.path()).unwrap();
            let store = provider.keyspace("wal").unwrap();
            store.put(b"pwal:persisted", b"payload").await.unwrap();
            store.flush().await.unwrap();
        }
        {
            let provider = SledProvider::open(dir.path()).unwrap();
            let store = provider.keyspace("wal").unwrap();
            assert_eq!(
                store.get(b"pwal:persisted").await.unwrap(),
                Some(b"payload".to_vec())
            );
        }
    }
}
