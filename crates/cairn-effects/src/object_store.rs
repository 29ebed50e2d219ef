//! In-memory content-addressed object store

use async_trait::async_trait;
use cairn_core::effects::ObjectStore;
use cairn_core::{CairnError, ObjectAddress, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Object store keyed by SHA-256 of the stored bytes; clones share state
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<ObjectAddress, Vec<u8>>>>,
}

impl MemoryObjectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct objects held
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether no objects are held
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Whether `address` has been stored
    pub async fn contains(&self, address: &ObjectAddress) -> bool {
        self.objects.read().await.contains_key(address)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ObjectAddress> {
        let address = ObjectAddress::for_content(&bytes);
        self.objects
            .write()
            .await
            .entry(address.clone())
            .or_insert(bytes);
        Ok(address)
    }

    async fn get(&self, address: &ObjectAddress) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| CairnError::not_found(format!("No object at {address}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_bytes_same_address() {
        let store = MemoryObjectStore::new();
        let a = store.put(b"ciphertext".to_vec()).await.unwrap();
        let b = store.put(b"ciphertext".to_vec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&a).await.unwrap(), b"ciphertext".to_vec());
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let store = MemoryObjectStore::new();
        let result = store.get(&ObjectAddress::for_content(b"nothing")).await;
        assert!(matches!(result, Err(CairnError::NotFound { .. })));
    }
}
