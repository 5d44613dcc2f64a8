//! Filesystem object backend.
//!
//! [`FsBackend`] maps object keys to files under a root directory. It lets
//! a submitter and a worker running as separate processes on one host (or
//! sharing a network mount) coordinate through the same store.
//!
//! Writes go to a hidden temporary file in the target directory first and
//! are then moved into place, so readers never observe a partially written
//! object. `put_if_absent` publishes with a hard link, which fails if the
//! target already exists.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::backend::{validate_key, ObjectBackend, StorageError};

const TEMP_PREFIX: &str = ".tmp-";

/// Object backend rooted at a local directory.
///
/// # Examples
///
/// ```
/// use task_handoff::store::FsBackend;
///
/// let backend = FsBackend::new("/var/lib/handoff");
/// assert_eq!(backend.root().to_str(), Some("/var/lib/handoff"));
/// ```
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Creates a backend rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, seg| path.join(seg)))
    }

    async fn write_temp(&self, target: &Path, data: &[u8]) -> Result<PathBuf, StorageError> {
        let parent = target.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::backend(format!("create {}", parent.display()), e))?;
        let temp = parent.join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&temp, data)
            .await
            .map_err(|e| StorageError::backend(format!("write {}", temp.display()), e))?;
        Ok(temp)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments: Option<Vec<&str>> = relative.iter().map(|s| s.to_str()).collect();
        Some(segments?.join("/"))
    }
}

#[async_trait]
impl ObjectBackend for FsBackend {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let target = self.path_for(key)?;
        let temp = self.write_temp(&target, data).await?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StorageError::backend(
                format!("rename into {}", target.display()),
                e,
            ));
        }
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<bool, StorageError> {
        let target = self.path_for(key)?;
        let temp = self.write_temp(&target, data).await?;
        let linked = tokio::fs::hard_link(&temp, &target).await;
        let _ = tokio::fs::remove_file(&temp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StorageError::backend(
                format!("link into {}", target.display()),
                e,
            )),
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(StorageError::backend(format!("read {}", path.display()), e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::backend(
                format!("delete {}", path.display()),
                e,
            )),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // Start walking at the deepest directory fully named by the prefix.
        let start = match prefix.rfind('/') {
            Some(idx) => self.path_for(&prefix[..idx])?,
            None => self.root.clone(),
        };

        let mut keys = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(StorageError::backend(format!("list {}", dir.display()), e))
                },
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::backend(format!("list {}", dir.display()), e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::backend(format!("stat {}", path.display()), e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    continue;
                }
                if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn uri_for(&self, key: &str) -> String {
        let mut uri = format!("file://{}/{key}", self.root.display());
        if uri.ends_with("//") {
            uri.pop();
        }
        uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        backend.put("sessions/t1/metadata.json", b"{}").await.unwrap();
        backend.put("sessions/t1/metadata.json", b"{\"a\":1}").await.unwrap();
        assert_eq!(
            backend.get("sessions/t1/metadata.json").await.unwrap(),
            b"{\"a\":1}"
        );
    }

    #[tokio::test]
    async fn put_if_absent_rejects_existing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        assert!(backend.put_if_absent("a/b", b"1").await.unwrap());
        assert!(!backend.put_if_absent("a/b", b"2").await.unwrap());
        assert_eq!(backend.get("a/b").await.unwrap(), b"1");
    }

    #[tokio::test]
    async fn missing_object_and_idempotent_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        assert!(matches!(
            backend.get("x/y").await,
            Err(StorageError::NotFound { .. })
        ));
        backend.put("x/y", b"1").await.unwrap();
        assert!(backend.delete("x/y").await.unwrap());
        assert!(!backend.delete("x/y").await.unwrap());
    }

    #[tokio::test]
    async fn list_walks_prefix_and_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        backend.put("sessions/t1/002-5.jsonl", b"").await.unwrap();
        backend.put("sessions/t1/001-4.jsonl", b"").await.unwrap();
        backend.put("sessions/t10/001-4.jsonl", b"").await.unwrap();
        tokio::fs::write(dir.path().join("sessions/t1/.tmp-junk"), b"")
            .await
            .unwrap();

        assert_eq!(
            backend.list("sessions/t1/").await.unwrap(),
            vec!["sessions/t1/001-4.jsonl", "sessions/t1/002-5.jsonl"]
        );
        assert_eq!(backend.list("sessions/").await.unwrap().len(), 3);
        assert!(backend.list("nothing/here/").await.unwrap().is_empty());
    }
}
