//! Process-local task bookkeeping for cancellation routing.
//!
//! A [`TaskRegistry`] maps each task dispatched by this process to its job
//! handle. It is an explicit handle owned by whoever runs the submitter; it
//! does not survive a restart, and tasks dispatched by another process
//! cannot be cancelled through it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::dispatch::{DispatchError, JobDispatcher, JobHandle};
use crate::types::{TaskId, TaskKind};

/// Registration failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The task is already registered.
    #[error("task {task_id} is already registered")]
    Duplicate {
        /// The duplicated identifier.
        task_id: TaskId,
    },
}

/// Snapshot of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredTask {
    /// Handle of the dispatched job.
    pub job_handle: JobHandle,
    /// Sync or async.
    pub kind: TaskKind,
    /// When the task was registered.
    pub started_at: DateTime<Utc>,
    /// Whether a cancellation was already requested.
    pub cancelling: bool,
}

/// Result of [`TaskRegistry::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAttempt {
    /// The platform accepted the termination request.
    Requested,
    /// The job had already finished; nothing was cancelled.
    JobAlreadyFinished,
    /// Another caller already cancelled this task.
    AlreadyCancelling,
    /// The task is not registered in this process.
    NotRegistered,
}

#[derive(Debug)]
struct TaskEntry {
    job_handle: JobHandle,
    kind: TaskKind,
    started_at: DateTime<Utc>,
    cancelling: AtomicBool,
}

/// In-memory map from task identifier to dispatched job.
///
/// # Examples
///
/// ```
/// use task_handoff::dispatch::JobHandle;
/// use task_handoff::registry::TaskRegistry;
/// use task_handoff::types::{TaskId, TaskKind};
///
/// let registry = TaskRegistry::new();
/// let id = TaskId::parse("t1").unwrap();
/// registry.register(id.clone(), JobHandle::new("job-1"), TaskKind::Sync).unwrap();
/// assert!(registry.register(id.clone(), JobHandle::new("job-2"), TaskKind::Sync).is_err());
/// assert_eq!(registry.get(&id).unwrap().job_handle.as_str(), "job-1");
/// ```
#[derive(Debug, Default)]
pub struct TaskRegistry {
    entries: DashMap<TaskId, Arc<TaskEntry>>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a dispatched task. Duplicates are rejected, never replaced.
    pub fn register(
        &self,
        task_id: TaskId,
        job_handle: JobHandle,
        kind: TaskKind,
    ) -> Result<(), RegistryError> {
        match self.entries.entry(task_id) {
            Entry::Occupied(slot) => Err(RegistryError::Duplicate {
                task_id: slot.key().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(TaskEntry {
                    job_handle,
                    kind,
                    started_at: Utc::now(),
                    cancelling: AtomicBool::new(false),
                }));
                Ok(())
            },
        }
    }

    /// Returns a snapshot of a task's entry.
    pub fn get(&self, task_id: &TaskId) -> Option<RegisteredTask> {
        self.entries.get(task_id).map(|entry| RegisteredTask {
            job_handle: entry.job_handle.clone(),
            kind: entry.kind,
            started_at: entry.started_at,
            cancelling: entry.cancelling.load(Ordering::Acquire),
        })
    }

    /// Requests cancellation of a task's job.
    ///
    /// The `cancelling` flag is set before the platform is called and never
    /// cleared, so of any number of concurrent callers exactly one reaches
    /// the platform. A platform error leaves the flag set.
    pub async fn cancel(
        &self,
        task_id: &TaskId,
        dispatcher: &JobDispatcher,
    ) -> Result<CancelAttempt, DispatchError> {
        let Some(entry) = self.entries.get(task_id).map(|e| Arc::clone(e.value())) else {
            return Ok(CancelAttempt::NotRegistered);
        };
        if entry
            .cancelling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(task_id = %task_id, "cancellation already in progress");
            return Ok(CancelAttempt::AlreadyCancelling);
        }

        if dispatcher.cancel(&entry.job_handle).await? {
            Ok(CancelAttempt::Requested)
        } else {
            Ok(CancelAttempt::JobAlreadyFinished)
        }
    }

    /// Forgets a task. Returns `true` if it was registered.
    pub fn unregister(&self, task_id: &TaskId) -> bool {
        self.entries.remove(task_id).is_some()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
