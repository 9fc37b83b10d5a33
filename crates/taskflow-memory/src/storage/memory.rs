//! In-memory blob storage.

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

use async_trait::async_trait;
use taskflow_core::traits::{BlobStorage, StorageError};

/// In-memory storage implementation.
///
/// Useful for tests and ephemeral engines.
/// Data is lost on restart.
#[derive(Default)]
pub struct InMemoryBlobStorage {
    records: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryBlobStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all namespaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .map(|r| r.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    /// Whether no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStorage for InMemoryBlobStorage {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .records
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.records
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);

        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let Some(ns) = records.get_mut(namespace) else {
            return Ok(false);
        };
        let existed = ns.remove(key).is_some();
        if ns.is_empty() {
            records.remove(namespace);
        }

        Ok(existed)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .records
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        let records = self
            .records
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut names: Vec<String> = records.keys().cloned().collect();
        names.sort();

        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let storage = InMemoryBlobStorage::new();
        storage.put("ns", "a", b"1".to_vec()).await.unwrap();

        assert_eq!(storage.get("ns", "a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(storage.get("ns", "b").await.unwrap(), None);
        assert_eq!(storage.get("other", "a").await.unwrap(), None);

        assert!(storage.delete("ns", "a").await.unwrap());
        assert!(!storage.delete("ns", "a").await.unwrap());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_list_and_namespaces() {
        let storage = InMemoryBlobStorage::new();
        storage.put("b", "k2", Vec::new()).await.unwrap();
        storage.put("b", "k1", Vec::new()).await.unwrap();
        storage.put("a", "k", Vec::new()).await.unwrap();

        assert_eq!(storage.list("b").await.unwrap(), vec!["k1", "k2"]);
        assert_eq!(storage.namespaces().await.unwrap(), vec!["a", "b"]);
        assert_eq!(storage.len(), 3);

        storage.delete("a", "k").await.unwrap();
        assert_eq!(storage.namespaces().await.unwrap(), vec!["b"]);
    }
}
