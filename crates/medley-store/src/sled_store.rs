//! Sled driver: one database directory, one tree per keyspace.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sled::{Db, Tree};

use crate::{KvProvider, KvStore, StoreError};

/// Sled-backed [`KvProvider`]. Opening may perform crash recovery if the
/// database was not closed cleanly.
#[derive(Debug, Clone)]
pub struct SledProvider {
    db: Db,
}

impl SledProvider {
    /// Open or create a database directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::Config::default().path(path).open()?;
        Ok(Self { db })
    }

    /// Open a temporary database that is discarded on drop. Test fixture.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Bytes occupied on disk.
    pub fn size_on_disk(&self) -> Result<u64, StoreError> {
        Ok(self.db.size_on_disk()?)
    }
}

impl KvProvider for SledProvider {
    fn keyspace(&self, name: &str) -> Result<Arc<dyn KvStore>, StoreError> {
        let tree = self.db.open_tree(name)?;
        Ok(Arc::new(SledStore { tree }))
    }
}

/// A single sled tree behind the [`KvStore`] contract.
#[derive(Debug, Clone)]
pub struct SledStore {
    tree: Tree,
}

impl SledStore {
    /// Wrap an already-open tree.
    pub fn from_tree(tree: Tree) -> Self {
        Self { tree }
    }
}

#[async_trait]
impl KvStore for SledStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree.get(key)?.map(|ivec| ivec.to_vec()))
    }

    async fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
        self.tree.remove(key)?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(prefix) {
            let (key, value) = item?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    async fn scan_from(
        &self,
        start: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut out = Vec::new();
        for item in self.tree.range(start.to_vec()..).take(limit) {
            let (key, value) = item?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    async fn compare_and_swap(
        &self,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, StoreError> {
        match self.tree.compare_and_swap(key, old, new)? {
            Ok(()) => Ok(true),
            Err(_mismatch) => Ok(false),
        }
    }

    async fn count_prefix(&self, prefix: &[u8]) -> Result<u64, StoreError> {
        let mut count = 0u64;
        for item in self.tree.scan_prefix(prefix) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn compact(&self) -> Result<(), StoreError> {
        // Sled reclaims log segments on flush; an explicit flush is the
        // engine's compaction hook at this layer.
        self.tree.flush_async().await?;
        Ok(())
    }
}
