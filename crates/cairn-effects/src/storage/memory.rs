//! In-memory durable store for tests and ephemeral runs

use async_trait::async_trait;
use cairn_core::effects::DurableStore;
use cairn_core::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory durable store; clones share the same map
#[derive(Debug, Clone, Default)]
pub struct MemoryDurableStore {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryDurableStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Whether the store holds no keys
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    /// Overwrite a value without any encoding; used to simulate corruption
    pub async fn insert_raw(&self, key: &str, value: Vec<u8>) {
        self.data.write().await.insert(key.to_string(), value);
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut data = self.data.write().await;
        data.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut data = self.data.write().await;
        Ok(data.remove(key).is_some())
    }
}
