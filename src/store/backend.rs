//! Low-level object storage backend trait.
//!
//! The [`ObjectBackend`] trait is the contract every storage engine
//! implements: [`put`](ObjectBackend::put),
//! [`put_if_absent`](ObjectBackend::put_if_absent),
//! [`get`](ObjectBackend::get), [`delete`](ObjectBackend::delete) and
//! [`list`](ObjectBackend::list).
//!
//! Domain logic (key layout, status transitions, chunk ordering,
//! serialization) does **not** belong here. Backends are dumb object
//! stores; domain logic lives in [`TaskStore`](crate::store::TaskStore).
//!
//! # Visibility
//!
//! A completed `put` must be visible to a `get` or `list` issued afterwards
//! by any process. Backends must not cache across process boundaries.

use std::fmt;

use async_trait::async_trait;

/// Errors that can occur during raw storage operations.
///
/// [`TaskStore`](crate::store::TaskStore) maps these to domain-aware
/// [`StoreError`](crate::store::StoreError) variants.
///
/// # Examples
///
/// ```
/// use task_handoff::store::StorageError;
///
/// let err = StorageError::NotFound { key: "sessions/t1/metadata.json".to_string() };
/// assert!(err.to_string().contains("sessions/t1/metadata.json"));
/// ```
#[derive(Debug)]
pub enum StorageError {
    /// No object exists under the key.
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// The key is not acceptable to this backend.
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An I/O or backend-specific error occurred (network failure, file
    /// system error, service error).
    Backend {
        /// Human-readable description of the error.
        message: String,
        /// The underlying error, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StorageError {
    /// Wraps an underlying error as a [`StorageError::Backend`].
    pub fn backend(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "object not found: {key}"),
            Self::InvalidKey { key, reason } => write!(f, "invalid object key {key}: {reason}"),
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

/// Object storage backend shared by submitter and worker processes.
///
/// Keys are `/`-separated relative paths such as
/// `sessions/{taskId}/metadata.json`. Backends must store and return keys
/// verbatim.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Stores an object unconditionally (create or overwrite).
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Stores an object only if no object exists under `key`.
    ///
    /// Returns `true` if the object was written, `false` if the key was
    /// already taken.
    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<bool, StorageError>;

    /// Retrieves an object.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if no object exists for the key.
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Deletes an object.
    ///
    /// Returns `true` if the key existed, `false` if it did not. Absence is
    /// never an error.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Lists the keys starting with `prefix`, sorted lexicographically.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Returns a human-readable location for a key or prefix, such as
    /// `s3://bucket/sessions/t1/` or `file:///var/lib/handoff/sessions/t1/`.
    fn uri_for(&self, key: &str) -> String;
}

/// Rejects keys that could escape the backend's namespace.
///
/// Empty segments, `.` and `..` are refused, as are absolute keys.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = |reason: &str| {
        Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        })
    };
    if key.is_empty() {
        return invalid("empty key");
    }
    if key.starts_with('/') {
        return invalid("absolute key");
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return invalid("empty or relative path segment");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_display() {
        let err = StorageError::NotFound {
            key: "a/b".to_string(),
        };
        assert_eq!(err.to_string(), "object not found: a/b");

        let err = StorageError::Backend {
            message: "connection reset".to_string(),
            source: None,
        };
        assert_eq!(err.to_string(), "backend error: connection reset");
    }

    #[test]
    fn storage_error_source_is_exposed() {
        let inner = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = StorageError::backend("read failed", inner);
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("timed out"));

        let err = StorageError::NotFound { key: "k".into() };
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn validate_key_rejects_traversal() {
        assert!(validate_key("sessions/t1/metadata.json").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("sessions/../etc").is_err());
        assert!(validate_key("sessions//x").is_err());
        assert!(validate_key("sessions/./x").is_err());
    }
}
