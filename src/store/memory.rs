//! In-memory object backend.
//!
//! [`InMemoryBackend`] provides a thread-safe [`ObjectBackend`] using
//! `DashMap<String, Vec<u8>>`. It is a dumb object store with no domain
//! logic, suited to tests and to running submitter and worker inside one
//! process.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use task_handoff::store::{InMemoryBackend, TaskStore};
//!
//! let store = TaskStore::new(Arc::new(InMemoryBackend::new()));
//! ```

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::backend::{validate_key, ObjectBackend, StorageError};

/// Thread-safe in-memory object backend using [`DashMap`].
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    objects: DashMap<String, Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    ///
    /// # Examples
    ///
    /// ```
    /// use task_handoff::store::InMemoryBackend;
    ///
    /// let backend = InMemoryBackend::new();
    /// assert!(backend.is_empty());
    /// ```
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if no objects are stored.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Returns `true` if an object exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }
}

#[async_trait]
impl ObjectBackend for InMemoryBackend {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        self.objects.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<bool, StorageError> {
        validate_key(key)?;
        match self.objects.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(data.to_vec());
                Ok(true)
            },
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn uri_for(&self, key: &str) -> String {
        format!("mem://{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_overwrite() {
        let backend = InMemoryBackend::new();
        backend.put("a/b", b"one").await.unwrap();
        backend.put("a/b", b"two").await.unwrap();
        assert_eq!(backend.get("a/b").await.unwrap(), b"two");
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn put_if_absent_keeps_first_writer() {
        let backend = InMemoryBackend::new();
        assert!(backend.put_if_absent("k/x", b"first").await.unwrap());
        assert!(!backend.put_if_absent("k/x", b"second").await.unwrap());
        assert_eq!(backend.get("k/x").await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let backend = InMemoryBackend::new();
        assert!(matches!(
            backend.get("nope/x").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = InMemoryBackend::new();
        backend.put("d/x", b"1").await.unwrap();
        assert!(backend.delete("d/x").await.unwrap());
        assert!(!backend.delete("d/x").await.unwrap());
    }

    #[tokio::test]
    async fn list_is_sorted_and_prefix_scoped() {
        let backend = InMemoryBackend::new();
        for key in ["s/t1/002", "s/t1/001", "s/t2/001", "s/t1/010"] {
            backend.put(key, b"").await.unwrap();
        }
        assert_eq!(
            backend.list("s/t1/").await.unwrap(),
            vec!["s/t1/001", "s/t1/002", "s/t1/010"]
        );
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let backend = InMemoryBackend::new();
        assert!(matches!(
            backend.put("../x", b"").await,
            Err(StorageError::InvalidKey { .. })
        ));
    }
}
