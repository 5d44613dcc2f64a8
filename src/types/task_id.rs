//! Task identifier newtype.
//!
//! A [`TaskId`] is embedded verbatim in object-store keys and job
//! parameters, so it is restricted to a URL-safe alphabet: ASCII
//! alphanumerics, `_` and `-`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Maximum accepted length of a task identifier, in bytes.
pub const MAX_TASK_ID_LEN: usize = 128;

/// Rejection reasons for a caller-supplied task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskIdError {
    /// The identifier was empty.
    #[error("task id must not be empty")]
    Empty,

    /// The identifier exceeded [`MAX_TASK_ID_LEN`].
    #[error("task id is {len} bytes, limit is {MAX_TASK_ID_LEN}")]
    TooLong {
        /// Actual length in bytes.
        len: usize,
    },

    /// The identifier contained a character outside `[A-Za-z0-9_-]`.
    #[error("task id contains invalid character {found:?} at position {position}")]
    InvalidCharacter {
        /// The offending character.
        found: char,
        /// Character index of the offending character.
        position: usize,
    },
}

/// Validated, URL-safe task identifier.
///
/// # Examples
///
/// ```
/// use task_handoff::types::TaskId;
///
/// let id = TaskId::parse("build_42-a").unwrap();
/// assert_eq!(id.as_str(), "build_42-a");
///
/// assert!(TaskId::parse("../etc/passwd").is_err());
/// assert!(TaskId::parse("").is_err());
///
/// let generated = TaskId::generate();
/// assert_eq!(generated.as_str().len(), 36);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Validates and wraps a caller-supplied identifier.
    pub fn parse(value: impl Into<String>) -> Result<Self, TaskIdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(TaskIdError::Empty);
        }
        if value.len() > MAX_TASK_ID_LEN {
            return Err(TaskIdError::TooLong { len: value.len() });
        }
        if let Some((position, found)) = value
            .chars()
            .enumerate()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(TaskIdError::InvalidCharacter { found, position });
        }
        Ok(Self(value))
    }

    /// Generates a fresh identifier (hyphenated UUIDv4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the identifier, returning the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TaskId {
    type Err = TaskIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}
