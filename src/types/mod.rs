//! Data model shared by the submitter and the worker.
//!
//! - [`task_id`] - URL-safe [`TaskId`] newtype.
//! - [`task`] - [`TaskMetadata`] status document and the [`TaskStatus`] state machine.
//! - [`result`] - Documents returned to callers and webhook receivers.

pub mod result;
pub mod task;
pub mod task_id;

pub use result::{CancelResponse, NotRunningReason, SubmissionResponse, TerminalResult};
pub use task::{
    TaskKind, TaskMetadata, TaskStatus, TaskSummary, TerminalFields, TransitionError,
    TERMINAL_STATUSES,
};
pub use task_id::{TaskId, TaskIdError, MAX_TASK_ID_LEN};
