use super::{ListOutput, Storage, StorageError};

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::sync::RwLock;

/// In-memory storage, for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes an object. Returns whether it existed.
    pub async fn remove(&self, key: &str) -> bool {
        self.objects.write().await.remove(key).is_some()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.objects.write().await.insert(key.to_owned(), data);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<ListOutput, StorageError> {
        let objects = self.objects.read().await;
        let entries = objects
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.len() as u64));
        Ok(ListOutput::delimited(prefix, entries))
    }
}
