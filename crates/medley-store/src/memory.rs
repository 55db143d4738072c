//! In-memory driver for tests and dry runs. Nothing survives the process.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{KvProvider, KvStore, StoreError};

/// Non-persistent [`KvStore`] over a sorted map.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    map: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvProvider for MemoryStore {
    fn keyspace(&self, _name: &str) -> Result<Arc<dyn KvStore>, StoreError> {
        // Each keyspace gets its own independent map.
        Ok(Arc::new(MemoryStore::new()))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.map.write().await.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
        self.map.write().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let map = self.map.read().await;
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn scan_from(
        &self,
        start: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let map = self.map.read().await;
        Ok(map
            .range(start.to_vec()..)
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, StoreError> {
        let mut map = self.map.write().await;
        let current = map.get(key).map(|value| value.as_slice());
        if current != old {
            return Ok(false);
        }
        match new {
            Some(value) => {
                map.insert(key.to_vec(), value.to_vec());
            }
            None => {
                map.remove(key);
            }
        }
        Ok(true)
    }

    async fn count_prefix(&self, prefix: &[u8]) -> Result<u64, StoreError> {
        let map = self.map.read().await;
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .count() as u64)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn compact(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
