//! Wire documents returned to callers and webhook receivers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::task::{TaskMetadata, TaskStatus, TaskSummary};
use super::task_id::TaskId;

/// Body of the webhook POST sent when a task reaches a terminal state.
///
/// # Examples
///
/// ```
/// use task_handoff::types::{TaskId, TaskKind, TaskMetadata, TaskStatus, TerminalFields, TerminalResult};
///
/// let mut meta = TaskMetadata::pending(
///     TaskId::parse("t-9").unwrap(),
///     TaskKind::Async,
///     Some("https://example.com/hook".into()),
///     None,
///     "tasks/t-9/payload.enc".into(),
/// );
/// meta.mark_terminal(
///     TaskStatus::Completed,
///     TerminalFields { exit_code: Some(0), ..Default::default() },
///     chrono::Utc::now(),
/// ).unwrap();
///
/// let result = TerminalResult::from_metadata(&meta, "mem://sessions/t-9/").unwrap();
/// let json = serde_json::to_value(&result).unwrap();
/// assert_eq!(json["status"], "completed");
/// assert_eq!(json["exitCode"], 0);
/// assert_eq!(json["logsPath"], "mem://sessions/t-9/");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalResult {
    /// Task identifier.
    pub task_id: TaskId,

    /// Terminal status.
    pub status: TaskStatus,

    /// Exit code of the opaque work, if it ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Store location of the task's log chunks.
    ///
    /// Chunk keys are `{seq:03}-{ms}.jsonl`, so raw key order matches
    /// sequence order only up to chunk 999. Parse the names with
    /// `ChunkName` and sort those, or use `TaskStore::list_log_chunks`.
    pub logs_path: String,

    /// Execution summary.
    pub summary: TaskSummary,

    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Caller metadata, echoed verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,

    /// When the terminal state was reached.
    pub completed_at: DateTime<Utc>,
}

impl TerminalResult {
    /// Builds the result from a terminal status document.
    ///
    /// Returns `None` when the document is not terminal yet.
    pub fn from_metadata(meta: &TaskMetadata, logs_path: impl Into<String>) -> Option<Self> {
        if !meta.is_terminal() {
            return None;
        }
        let completed_at = meta.completed_at.or(meta.cancelled_at)?;
        Some(Self {
            task_id: meta.task_id.clone(),
            status: meta.status,
            exit_code: meta.exit_code,
            logs_path: logs_path.into(),
            summary: meta.summary.clone().unwrap_or_default(),
            error: meta.error.clone(),
            metadata: meta.metadata.clone(),
            completed_at,
        })
    }
}

/// Response to an accepted asynchronous submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResponse {
    /// Identifier of the accepted task.
    pub task_id: TaskId,
    /// Always `pending` at submission time.
    pub status: TaskStatus,
    /// Store location where log chunks will appear.
    pub logs_path: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl SubmissionResponse {
    /// HTTP status code an HTTP front end should answer with.
    pub const HTTP_STATUS: u16 = 202;
}

/// Why a cancellation request found nothing to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotRunningReason {
    /// No such task is known to this process or the store.
    NotFound,
    /// The task already reached a terminal state.
    AlreadyTerminal,
}

/// Outcome of a cancellation request.
///
/// None of these are errors: cancelling a finished or unknown task is
/// reported as "not currently running".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelResponse {
    /// Termination was requested and the status is now `cancelled`.
    #[serde(rename_all = "camelCase")]
    Cancelled {
        /// Task identifier.
        task_id: TaskId,
        /// Always `cancelled`.
        status: TaskStatus,
    },

    /// Nothing to cancel.
    #[serde(rename_all = "camelCase")]
    NotRunning {
        /// Task identifier.
        task_id: TaskId,
        /// Unknown vs. already finished.
        reason: NotRunningReason,
    },

    /// Another request is already cancelling this task.
    #[serde(rename_all = "camelCase")]
    AlreadyCancelling {
        /// Task identifier.
        task_id: TaskId,
    },
}

impl CancelResponse {
    /// Returns `true` only for [`CancelResponse::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
