//! Task status document and its state machine.
//!
//! [`TaskMetadata`] is the document stored at
//! `sessions/{taskId}/metadata.json`. It is the only channel through which
//! the submitter observes a worker, so every transition rewrites the whole
//! document.
//!
//! # State Machine
//!
//! ```text
//! Pending -> Running, Completed, Failed, Cancelled
//! Running -> Completed, Failed, Cancelled
//! Completed | Failed | Cancelled -> (terminal, no transitions)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::task_id::TaskId;

/// Whether the caller waits on a live stream or receives a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// The submitter tails the store and relays output to a live client.
    Sync,
    /// The worker notifies `callbackUrl` on completion.
    Async,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
        }
    }
}

/// Task lifecycle status.
///
/// # Examples
///
/// ```
/// use task_handoff::types::TaskStatus;
///
/// assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::Running));
/// assert!(TaskStatus::Running.can_transition_to(&TaskStatus::Cancelled));
/// assert!(!TaskStatus::Completed.can_transition_to(&TaskStatus::Running));
/// assert!(!TaskStatus::Running.can_transition_to(&TaskStatus::Running));
/// assert!(!TaskStatus::Running.can_transition_to(&TaskStatus::Pending));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Dispatched, worker has not reported yet.
    Pending,
    /// Worker has started executing.
    Running,
    /// Work finished with exit code 0 (terminal).
    Completed,
    /// Work failed, or could not be started (terminal).
    Failed,
    /// Termination was requested and accepted by the platform (terminal).
    Cancelled,
}

/// The set of statuses from which no further transition occurs.
pub const TERMINAL_STATUSES: [TaskStatus; 3] = [
    TaskStatus::Completed,
    TaskStatus::Failed,
    TaskStatus::Cancelled,
];

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl TaskStatus {
    /// Returns `true` for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        TERMINAL_STATUSES.contains(self)
    }

    /// Returns `true` if moving from this status to `next` is allowed.
    ///
    /// Self-transitions and any move out of a terminal state are rejected,
    /// which keeps the status monotonic.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next {
            return false;
        }
        match self {
            Self::Pending => matches!(
                next,
                Self::Running | Self::Completed | Self::Failed | Self::Cancelled
            ),
            Self::Running => matches!(next, Self::Completed | Self::Failed | Self::Cancelled),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Validates a transition, returning a [`TransitionError`] on rejection.
    pub fn validate_transition(&self, task_id: &TaskId, next: &Self) -> Result<(), TransitionError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TransitionError {
                task_id: task_id.clone(),
                from: *self,
                to: *next,
            })
        }
    }
}

/// A rejected status transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition from {from} to {to} for task {task_id}")]
pub struct TransitionError {
    /// The task being transitioned.
    pub task_id: TaskId,
    /// Current status.
    pub from: TaskStatus,
    /// Rejected target status.
    pub to: TaskStatus,
}

/// Execution summary, populated only at the terminal transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    /// Wall-clock duration from start (or creation) to the terminal state.
    pub duration_ms: u64,

    /// Number of agent turns reported by the executor, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turns: Option<u32>,

    /// Number of error lines emitted during execution, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<u32>,
}

/// Fields recorded together with a terminal status.
#[derive(Debug, Clone, Default)]
pub struct TerminalFields {
    /// Exit code reported by the executor.
    pub exit_code: Option<i32>,
    /// Human-readable failure reason.
    pub error: Option<String>,
    /// Agent turns reported by the executor.
    pub turns: Option<u32>,
    /// Count of lines written to the error stream.
    pub errors: Option<u32>,
}

/// The status document for one task.
///
/// # Examples
///
/// ```
/// use task_handoff::types::{TaskId, TaskKind, TaskMetadata, TaskStatus};
///
/// let mut meta = TaskMetadata::pending(
///     TaskId::parse("t-1").unwrap(),
///     TaskKind::Sync,
///     None,
///     None,
///     "tasks/t-1/payload.enc".to_string(),
/// );
/// assert_eq!(meta.status, TaskStatus::Pending);
///
/// meta.mark_running(chrono::Utc::now()).unwrap();
/// assert!(meta.started_at.is_some());
///
/// let json = serde_json::to_value(&meta).unwrap();
/// assert_eq!(json["taskId"], "t-1");
/// assert_eq!(json["status"], "running");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    /// Task identifier.
    pub task_id: TaskId,

    /// Sync or async delivery.
    pub kind: TaskKind,

    /// Current status.
    pub status: TaskStatus,

    /// When the submitter created the task.
    pub created_at: DateTime<Utc>,

    /// When the worker reported start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached `completed` or `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// When the task reached `cancelled`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,

    /// Webhook target, present for async tasks only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,

    /// Caller-opaque map, echoed back verbatim in the terminal result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,

    /// Execution summary (terminal states only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<TaskSummary>,

    /// Exit code of the opaque work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Location of the encrypted payload in the store.
    pub payload_pointer: String,
}

impl TaskMetadata {
    /// Creates a `pending` document stamped with the current time.
    pub fn pending(
        task_id: TaskId,
        kind: TaskKind,
        callback_url: Option<String>,
        metadata: Option<Map<String, Value>>,
        payload_pointer: String,
    ) -> Self {
        Self {
            task_id,
            kind,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            callback_url,
            metadata,
            summary: None,
            exit_code: None,
            error: None,
            payload_pointer,
        }
    }

    /// Moves the document to `running`.
    pub fn mark_running(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.status
            .validate_transition(&self.task_id, &TaskStatus::Running)?;
        self.status = TaskStatus::Running;
        self.started_at = Some(at);
        Ok(())
    }

    /// Moves the document to a terminal status and fills in the summary.
    ///
    /// `status` must be terminal; non-terminal targets are rejected as an
    /// invalid transition.
    pub fn mark_terminal(
        &mut self,
        status: TaskStatus,
        fields: TerminalFields,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !status.is_terminal() {
            return Err(TransitionError {
                task_id: self.task_id.clone(),
                from: self.status,
                to: status,
            });
        }
        self.status.validate_transition(&self.task_id, &status)?;

        let since = self.started_at.unwrap_or(self.created_at);
        let duration_ms = u64::try_from((at - since).num_milliseconds()).unwrap_or(0);

        self.status = status;
        match status {
            TaskStatus::Cancelled => self.cancelled_at = Some(at),
            _ => self.completed_at = Some(at),
        }
        self.exit_code = fields.exit_code;
        self.error = fields.error;
        self.summary = Some(TaskSummary {
            duration_ms,
            turns: fields.turns,
            errors: fields.errors,
        });
        Ok(())
    }

    /// Shorthand for a cancellation with no exit code.
    pub fn mark_cancelled(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.mark_terminal(TaskStatus::Cancelled, TerminalFields::default(), at)
    }

    /// Returns `true` if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
