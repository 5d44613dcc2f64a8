//! Object key layout shared by every backend.
//!
//! ```text
//! sessions/{taskId}/metadata.json
//! sessions/{taskId}/{seq:03}-{timestampMs}.jsonl
//! tasks/{taskId}/payload.enc
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::TaskId;

/// File name of the status document inside a session prefix.
pub const METADATA_FILE: &str = "metadata.json";

/// File name of the encrypted envelope inside a task prefix.
pub const PAYLOAD_FILE: &str = "payload.enc";

const CHUNK_EXTENSION: &str = ".jsonl";

/// Prefix holding a task's metadata and log chunks.
pub fn session_prefix(task_id: &TaskId) -> String {
    format!("sessions/{task_id}/")
}

/// Key of a task's status document.
pub fn metadata_key(task_id: &TaskId) -> String {
    format!("sessions/{task_id}/{METADATA_FILE}")
}

/// Key of one log chunk.
pub fn chunk_key(task_id: &TaskId, chunk: &ChunkName) -> String {
    format!("sessions/{task_id}/{chunk}")
}

/// Key of a task's encrypted payload.
pub fn payload_key(task_id: &TaskId) -> String {
    format!("tasks/{task_id}/{PAYLOAD_FILE}")
}

/// Name of an immutable log chunk.
///
/// Ordering compares the sequence number first. Zero padding keeps
/// lexicographic and numeric order aligned up to sequence 999; callers
/// must sort parsed names rather than raw keys beyond that.
///
/// # Examples
///
/// ```
/// use task_handoff::store::ChunkName;
///
/// let name = ChunkName::new(7, 1_700_000_000_000);
/// assert_eq!(name.to_string(), "007-1700000000000.jsonl");
/// assert_eq!("007-1700000000000.jsonl".parse::<ChunkName>().unwrap(), name);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkName {
    /// Sequence number, starting at 1 and gap-free per task.
    pub seq: u32,
    /// Creation time in Unix milliseconds.
    pub timestamp_ms: i64,
}

impl ChunkName {
    /// Creates a chunk name.
    pub fn new(seq: u32, timestamp_ms: i64) -> Self {
        Self { seq, timestamp_ms }
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}-{}{CHUNK_EXTENSION}", self.seq, self.timestamp_ms)
    }
}

/// Error returned when a file name is not a chunk name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a log chunk name: {0}")]
pub struct ChunkNameError(pub String);

impl FromStr for ChunkName {
    type Err = ChunkNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ChunkNameError(s.to_string());
        let stem = s.strip_suffix(CHUNK_EXTENSION).ok_or_else(invalid)?;
        let (seq, ts) = stem.split_once('-').ok_or_else(invalid)?;
        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        Ok(Self {
            seq: seq.parse().map_err(|_| invalid())?,
            timestamp_ms: ts.parse().map_err(|_| invalid())?,
        })
    }
}

/// Location reference to an encrypted payload.
///
/// This is the only payload-related value handed to a job platform; it
/// names where the envelope lives, never what it contains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadPointer(String);

impl PayloadPointer {
    /// Pointer to the payload of `task_id`.
    pub fn for_task(task_id: &TaskId) -> Self {
        Self(payload_key(task_id))
    }

    /// Wraps a pointer received from elsewhere (job parameters, metadata).
    ///
    /// Returns `None` unless it has the `tasks/{taskId}/payload.enc` shape.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix("tasks/")?;
        let (id, file) = rest.split_once('/')?;
        if file != PAYLOAD_FILE {
            return None;
        }
        TaskId::parse(id).ok()?;
        Some(Self(raw.to_string()))
    }

    /// The object key this pointer refers to.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PayloadPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
