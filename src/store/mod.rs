//! Durable task state storage.
//!
//! Storage is split in two layers, mirroring how the submitter and the
//! worker share nothing but objects:
//!
//! - [`ObjectBackend`] - a dumb object store (put, get, delete, list).
//!   Implementations: [`InMemoryBackend`], [`FsBackend`] and, behind the
//!   `aws` feature, `S3Backend`.
//! - [`TaskStore`] - every domain rule: the key [`layout`], the status
//!   state machine, immutable log chunks, and JSON at the storage boundary.
//!
//! Neither layer caches. Anything written by one process is read back
//! from the backend by the other.

pub mod backend;
pub mod fs;
pub mod layout;
pub mod memory;
#[cfg(feature = "aws")]
pub mod s3;

use std::sync::Arc;

use thiserror::Error;

use crate::logs::LogEntry;
use crate::types::{TaskId, TaskMetadata, TransitionError};

pub use backend::{ObjectBackend, StorageError};
pub use fs::FsBackend;
pub use layout::{ChunkName, ChunkNameError, PayloadPointer};
pub use memory::InMemoryBackend;
#[cfg(feature = "aws")]
pub use s3::S3Backend;

/// Domain-level storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A status document already exists for the task identifier.
    #[error("task {task_id} already exists")]
    AlreadyExists {
        /// The duplicated identifier.
        task_id: TaskId,
    },

    /// No status document exists for the task.
    #[error("task {task_id} not found")]
    TaskNotFound {
        /// The missing task.
        task_id: TaskId,
    },

    /// No encrypted payload exists at the pointer.
    #[error("encrypted payload not found at {pointer}")]
    PayloadNotFound {
        /// The dangling pointer.
        pointer: PayloadPointer,
    },

    /// A log chunk with the same name was already written.
    #[error("log chunk {key} already exists")]
    ChunkExists {
        /// Key of the existing chunk.
        key: String,
    },

    /// The requested status change is not allowed.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// A stored document could not be encoded or decoded.
    #[error("failed to {action} {key}: {source}")]
    Serialization {
        /// `encode` or `decode`.
        action: &'static str,
        /// Object key involved.
        key: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Task-aware store shared by submitter and worker.
///
/// Cheap to clone; clones share the backend.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use task_handoff::store::{InMemoryBackend, TaskStore};
/// use task_handoff::types::TaskId;
///
/// let store = TaskStore::new(Arc::new(InMemoryBackend::new()));
/// let id = TaskId::parse("t1").unwrap();
/// assert_eq!(store.logs_path(&id), "mem://sessions/t1/");
/// ```
#[derive(Clone)]
pub struct TaskStore {
    backend: Arc<dyn ObjectBackend>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore").finish_non_exhaustive()
    }
}

impl TaskStore {
    /// Creates a store over `backend`.
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self { backend }
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    // ---- Encrypted payload ----

    /// Stores an encrypted envelope and returns the pointer to it.
    pub async fn put_encrypted_payload(
        &self,
        task_id: &TaskId,
        envelope: &[u8],
    ) -> Result<PayloadPointer, StoreError> {
        let pointer = PayloadPointer::for_task(task_id);
        self.backend.put(pointer.as_str(), envelope).await?;
        Ok(pointer)
    }

    /// Reads the envelope a pointer refers to.
    pub async fn get_encrypted_payload(
        &self,
        pointer: &PayloadPointer,
    ) -> Result<Vec<u8>, StoreError> {
        match self.backend.get(pointer.as_str()).await {
            Ok(bytes) => Ok(bytes),
            Err(StorageError::NotFound { .. }) => Err(StoreError::PayloadNotFound {
                pointer: pointer.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a task's envelope. Absence is not an error.
    ///
    /// Returns `true` if an envelope was removed.
    pub async fn delete_encrypted_payload(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        let existed = self.backend.delete(&layout::payload_key(task_id)).await?;
        if !existed {
            tracing::debug!(task_id = %task_id, "encrypted payload already absent");
        }
        Ok(existed)
    }

    // ---- Metadata ----

    /// Writes the first status document for a task.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] if any status document exists for
    /// the identifier, whatever its status.
    pub async fn create_metadata(&self, metadata: &TaskMetadata) -> Result<(), StoreError> {
        let key = layout::metadata_key(&metadata.task_id);
        let bytes = Self::encode(&key, metadata)?;
        if self.backend.put_if_absent(&key, &bytes).await? {
            Ok(())
        } else {
            Err(StoreError::AlreadyExists {
                task_id: metadata.task_id.clone(),
            })
        }
    }

    /// Overwrites a task's status document.
    pub async fn put_metadata(&self, metadata: &TaskMetadata) -> Result<(), StoreError> {
        let key = layout::metadata_key(&metadata.task_id);
        let bytes = Self::encode(&key, metadata)?;
        self.backend.put(&key, &bytes).await?;
        Ok(())
    }

    /// Reads a task's status document.
    ///
    /// Returns `Ok(None)` for an unknown task so pollers can tell "not
    /// written yet" apart from a storage failure.
    pub async fn get_metadata(&self, task_id: &TaskId) -> Result<Option<TaskMetadata>, StoreError> {
        let key = layout::metadata_key(task_id);
        match self.backend.get(&key).await {
            Ok(bytes) => Ok(Some(Self::decode(&key, &bytes)?)),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies a status change to the stored document and writes it back.
    ///
    /// `apply` runs against the current document and must go through the
    /// [`TaskMetadata`] transition methods, so the state machine is checked
    /// against what is actually stored.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use task_handoff::store::TaskStore;
    /// # use task_handoff::types::TaskId;
    /// # async fn demo(store: TaskStore, id: TaskId) -> Result<(), Box<dyn std::error::Error>> {
    /// let updated = store
    ///     .transition(&id, |meta| meta.mark_running(chrono::Utc::now()))
    ///     .await?;
    /// assert!(!updated.is_terminal());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn transition<F>(&self, task_id: &TaskId, apply: F) -> Result<TaskMetadata, StoreError>
    where
        F: FnOnce(&mut TaskMetadata) -> Result<(), TransitionError>,
    {
        let mut metadata =
            self.get_metadata(task_id)
                .await?
                .ok_or_else(|| StoreError::TaskNotFound {
                    task_id: task_id.clone(),
                })?;
        let from = metadata.status;
        apply(&mut metadata)?;
        self.put_metadata(&metadata).await?;
        tracing::debug!(task_id = %task_id, from = %from, to = %metadata.status, "task status updated");
        Ok(metadata)
    }

    // ---- Log chunks ----

    /// Writes an immutable log chunk, one JSON object per line.
    ///
    /// Returns the chunk's key.
    pub async fn write_chunk(
        &self,
        task_id: &TaskId,
        chunk: &ChunkName,
        entries: &[LogEntry],
    ) -> Result<String, StoreError> {
        let key = layout::chunk_key(task_id, chunk);
        let mut body = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut body, entry).map_err(|source| StoreError::Serialization {
                action: "encode",
                key: key.clone(),
                source,
            })?;
            body.push(b'\n');
        }
        if !self.backend.put_if_absent(&key, &body).await? {
            return Err(StoreError::ChunkExists { key });
        }
        Ok(key)
    }

    /// Lists a task's log chunks ordered by sequence number.
    pub async fn list_log_chunks(&self, task_id: &TaskId) -> Result<Vec<ChunkName>, StoreError> {
        let prefix = layout::session_prefix(task_id);
        let mut chunks: Vec<ChunkName> = self
            .backend
            .list(&prefix)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|name| name.parse().ok())
            .collect();
        chunks.sort();
        Ok(chunks)
    }

    /// Reads the entries of one chunk in write order.
    pub async fn read_chunk(
        &self,
        task_id: &TaskId,
        chunk: &ChunkName,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let key = layout::chunk_key(task_id, chunk);
        let bytes = self.backend.get(&key).await?;
        bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| Self::decode(&key, line))
            .collect()
    }

    /// Human-readable location of a task's logs.
    pub fn logs_path(&self, task_id: &TaskId) -> String {
        self.backend.uri_for(&layout::session_prefix(task_id))
    }

    // ---- Serialization helpers ----

    fn encode<T: serde::Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(value).map_err(|source| StoreError::Serialization {
            action: "encode",
            key: key.to_string(),
            source,
        })
    }

    fn decode<T: serde::de::DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
        serde_json::from_slice(bytes).map_err(|source| StoreError::Serialization {
            action: "decode",
            key: key.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskKind, TaskStatus};
    use chrono::Utc;

    fn store() -> TaskStore {
        TaskStore::new(Arc::new(InMemoryBackend::new()))
    }

    fn pending(id: &str) -> TaskMetadata {
        let task_id = TaskId::parse(id).unwrap();
        let pointer = PayloadPointer::for_task(&task_id).to_string();
        TaskMetadata::pending(task_id, TaskKind::Sync, None, None, pointer)
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let store = store();
        let meta = pending("dup");
        store.create_metadata(&meta).await.unwrap();
        assert!(matches!(
            store.create_metadata(&meta).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_metadata_is_none() {
        let id = TaskId::parse("ghost").unwrap();
        assert!(store().get_metadata(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transition_checks_stored_status() {
        let store = store();
        let meta = pending("t");
        store.create_metadata(&meta).await.unwrap();

        let done = store
            .transition(&meta.task_id, |m| m.mark_cancelled(Utc::now()))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Cancelled);

        let err = store
            .transition(&meta.task_id, |m| m.mark_running(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn transition_on_missing_task() {
        let id = TaskId::parse("nope").unwrap();
        let err = store()
            .transition(&id, |m| m.mark_running(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn chunks_are_immutable_and_listed_in_order() {
        let store = store();
        let id = TaskId::parse("logs").unwrap();
        store.put_metadata(&pending("logs")).await.unwrap();
        for seq in [2, 1, 3] {
            store
                .write_chunk(&id, &ChunkName::new(seq, 100), &[LogEntry::stdout(format!("line {seq}"))])
                .await
                .unwrap();
        }
        let err = store
            .write_chunk(&id, &ChunkName::new(1, 100), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ChunkExists { .. }));

        let chunks = store.list_log_chunks(&id).await.unwrap();
        assert_eq!(chunks.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        let lines = store.read_chunk(&id, &chunks[1]).await.unwrap();
        assert_eq!(lines[0].line, "line 2");
    }

    #[tokio::test]
    async fn chunks_past_999_list_after_earlier_ones() {
        let store = store();
        let id = TaskId::parse("long").unwrap();
        for seq in [1000, 999, 5] {
            store
                .write_chunk(&id, &ChunkName::new(seq, 1), &[LogEntry::stdout("x")])
                .await
                .unwrap();
        }
        let raw = store.backend.list(&layout::session_prefix(&id)).await.unwrap();
        assert!(raw[0].ends_with("/005-1.jsonl"));
        assert!(raw[1].ends_with("/1000-1.jsonl"));

        let chunks = store.list_log_chunks(&id).await.unwrap();
        assert_eq!(chunks.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![5, 999, 1000]);
    }

    #[tokio::test]
    async fn payload_delete_is_idempotent() {
        let store = store();
        let id = TaskId::parse("twice").unwrap();
        store.put_encrypted_payload(&id, b"{}").await.unwrap();
        assert!(store.delete_encrypted_payload(&id).await.unwrap());
        assert!(!store.delete_encrypted_payload(&id).await.unwrap());
    }

    #[tokio::test]
    async fn missing_payload_is_reported_with_pointer() {
        let id = TaskId::parse("p").unwrap();
        let pointer = PayloadPointer::for_task(&id);
        assert!(matches!(
            store().get_encrypted_payload(&pointer).await,
            Err(StoreError::PayloadNotFound { .. })
        ));
    }
}
