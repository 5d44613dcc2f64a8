//! Job-execution platform seam.
//!
//! A [`JobPlatform`] starts, queries and cancels one-shot jobs. The only
//! data a job ever receives is a [`JobRequest`]: a task identifier and a
//! pointer to the encrypted payload.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::store::PayloadPointer;
use crate::types::{TaskId, TaskIdError};

/// Job parameter carrying the task identifier.
pub const TASK_ID_PARAM: &str = "TASK_ID";

/// Job parameter carrying the encrypted payload pointer.
pub const PAYLOAD_POINTER_PARAM: &str = "PAYLOAD_POINTER";

/// Parameters of one job run.
///
/// ```
/// use task_handoff::dispatch::JobRequest;
/// use task_handoff::store::PayloadPointer;
/// use task_handoff::types::TaskId;
///
/// let id = TaskId::parse("t-9").unwrap();
/// let request = JobRequest::new(id.clone(), PayloadPointer::for_task(&id));
/// let params = request.parameters();
/// assert_eq!(params[0], ("TASK_ID", "t-9".to_string()));
/// assert_eq!(params[1], ("PAYLOAD_POINTER", "tasks/t-9/payload.enc".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Task to run.
    pub task_id: TaskId,
    /// Where the encrypted payload lives.
    pub payload_pointer: PayloadPointer,
}

/// A job parameter was missing or malformed.
#[derive(Debug, thiserror::Error)]
pub enum JobRequestError {
    /// A required parameter is absent.
    #[error("missing job parameter {0}")]
    Missing(&'static str),
    /// The task identifier is malformed.
    #[error("invalid {TASK_ID_PARAM}: {0}")]
    TaskId(#[from] TaskIdError),
    /// The payload pointer does not name a payload object.
    #[error("invalid {PAYLOAD_POINTER_PARAM}: {0}")]
    PayloadPointer(String),
}

impl JobRequest {
    /// Creates a request.
    pub fn new(task_id: TaskId, payload_pointer: PayloadPointer) -> Self {
        Self {
            task_id,
            payload_pointer,
        }
    }

    /// The name/value pairs handed to the platform.
    pub fn parameters(&self) -> [(&'static str, String); 2] {
        [
            (TASK_ID_PARAM, self.task_id.to_string()),
            (PAYLOAD_POINTER_PARAM, self.payload_pointer.to_string()),
        ]
    }

    /// Rebuilds a request from parameters, e.g. `|k| std::env::var(k).ok()`.
    pub fn from_parameters<F>(lookup: F) -> Result<Self, JobRequestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let task_id = lookup(TASK_ID_PARAM).ok_or(JobRequestError::Missing(TASK_ID_PARAM))?;
        let pointer =
            lookup(PAYLOAD_POINTER_PARAM).ok_or(JobRequestError::Missing(PAYLOAD_POINTER_PARAM))?;
        let task_id = TaskId::parse(task_id)?;
        let payload_pointer = PayloadPointer::parse(&pointer)
            .ok_or(JobRequestError::PayloadPointer(pointer))?;
        Ok(Self::new(task_id, payload_pointer))
    }
}

/// Opaque identifier of a started job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    /// Wraps a platform-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platform-reported job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Accepted, not started.
    Queued,
    /// Executing.
    Running,
    /// Exited successfully.
    Succeeded,
    /// Exited with a failure.
    Failed,
    /// Terminated on request.
    Cancelled,
}

impl JobState {
    /// Returns `true` once the job will not run any further.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Cause of a platform error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformErrorKind {
    /// The named job definition does not exist.
    DefinitionNotFound,
    /// The caller may not run or cancel the job.
    PermissionDenied,
    /// The job had already finished.
    AlreadyFinished,
    /// The job handle is unknown to the platform.
    JobNotFound,
    /// Anything else.
    Other,
}

/// Error returned by a [`JobPlatform`].
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct PlatformError {
    /// Classified cause.
    pub kind: PlatformErrorKind,
    /// Platform-provided description.
    pub message: String,
    /// Underlying error, if any.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PlatformError {
    /// Creates an error without an underlying source.
    pub fn new(kind: PlatformErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches an underlying error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

/// A container job-execution platform.
#[async_trait]
pub trait JobPlatform: Send + Sync {
    /// Starts one run of the job definition `job_name`.
    async fn run_job(&self, job_name: &str, request: &JobRequest)
        -> Result<JobHandle, PlatformError>;

    /// Requests termination. Returns once the platform accepted the request.
    ///
    /// A job that already finished yields [`PlatformErrorKind::AlreadyFinished`].
    async fn cancel_job(&self, handle: &JobHandle) -> Result<(), PlatformError>;

    /// Current state, or `None` if the platform does not know the job.
    async fn job_state(&self, handle: &JobHandle) -> Result<Option<JobState>, PlatformError>;
}

/// How long a finished job stays queryable before its entry is dropped.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(300);

type Jobs = DashMap<JobHandle, TrackedJob>;

/// Bookkeeping for jobs run by the platforms in this crate.
///
/// Every job gets a fresh UUID handle. Finished jobs are forgotten once
/// the retention elapses; after that they are reported as unknown.
#[derive(Debug)]
pub(crate) struct JobTable {
    jobs: Arc<Jobs>,
    retention: Duration,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::with_retention(DEFAULT_JOB_RETENTION)
    }
}

#[derive(Debug)]
struct TrackedJob {
    cancel: CancellationToken,
    state: watch::Receiver<JobState>,
}

/// Handed to the task driving a job so it can publish state changes.
#[derive(Debug)]
pub(crate) struct JobSlot {
    pub(crate) handle: JobHandle,
    pub(crate) cancel: CancellationToken,
    state: watch::Sender<JobState>,
    jobs: Weak<Jobs>,
    retention: Duration,
}

impl JobSlot {
    pub(crate) fn running(&self) {
        self.state.send_replace(JobState::Running);
    }

    /// Publishes the final state and schedules the entry's eviction.
    pub(crate) fn finish(self, final_state: JobState) {
        self.state.send_replace(final_state);
        let JobSlot {
            handle,
            jobs,
            retention,
            ..
        } = self;
        if retention.is_zero() {
            if let Some(jobs) = jobs.upgrade() {
                jobs.remove(&handle);
            }
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(jobs) = jobs.upgrade() {
                jobs.remove(&handle);
            }
        });
    }
}

impl JobTable {
    pub(crate) fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            retention,
        }
    }

    /// Registers a new job of `job_name` under a fresh handle.
    pub(crate) fn insert(&self, job_name: &str) -> JobSlot {
        let handle = JobHandle::new(format!("{job_name}-{}", uuid::Uuid::new_v4()));
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(JobState::Queued);
        self.jobs.insert(
            handle.clone(),
            TrackedJob {
                cancel: cancel.clone(),
                state: rx,
            },
        );
        JobSlot {
            handle,
            cancel,
            state: tx,
            jobs: Arc::downgrade(&self.jobs),
            retention: self.retention,
        }
    }

    pub(crate) fn cancel(&self, handle: &JobHandle) -> Result<(), PlatformError> {
        let job = self.jobs.get(handle).ok_or_else(|| {
            PlatformError::new(PlatformErrorKind::JobNotFound, format!("unknown job {handle}"))
        })?;
        let state = *job.state.borrow();
        if state.is_finished() {
            return Err(PlatformError::new(
                PlatformErrorKind::AlreadyFinished,
                format!("job {handle} already {state}"),
            ));
        }
        job.cancel.cancel();
        Ok(())
    }

    pub(crate) fn state(&self, handle: &JobHandle) -> Option<JobState> {
        self.jobs.get(handle).map(|job| *job.state.borrow())
    }

    pub(crate) async fn wait(&self, handle: &JobHandle) -> Option<JobState> {
        let mut rx = self.jobs.get(handle)?.state.clone();
        let finished = rx.wait_for(JobState::is_finished).await.ok().map(|s| *s);
        finished.or_else(|| Some(*rx.borrow()))
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_round_trip_through_lookup() {
        let id = TaskId::parse("abc").unwrap();
        let request = JobRequest::new(id.clone(), PayloadPointer::for_task(&id));
        let params = request.parameters();
        let lookup = |key: &str| {
            params
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(JobRequest::from_parameters(lookup).unwrap(), request);
    }

    #[test]
    fn from_parameters_rejects_bad_input() {
        let missing = JobRequest::from_parameters(|_| None).unwrap_err();
        assert!(matches!(missing, JobRequestError::Missing(TASK_ID_PARAM)));

        let bad_pointer = JobRequest::from_parameters(|k| match k {
            TASK_ID_PARAM => Some("abc".into()),
            _ => Some("sessions/abc/metadata.json".into()),
        })
        .unwrap_err();
        assert!(matches!(bad_pointer, JobRequestError::PayloadPointer(_)));
    }

    #[tokio::test]
    async fn job_table_cancel_rules() {
        let table = JobTable::default();
        let slot = table.insert("j");
        let handle = slot.handle.clone();
        assert_eq!(table.state(&handle), Some(JobState::Queued));

        table.cancel(&handle).unwrap();
        assert!(slot.cancel.is_cancelled());
        slot.finish(JobState::Cancelled);
        assert_eq!(table.wait(&handle).await, Some(JobState::Cancelled));

        let err = table.cancel(&handle).unwrap_err();
        assert_eq!(err.kind, PlatformErrorKind::AlreadyFinished);
        let err = table.cancel(&JobHandle::new("nope")).unwrap_err();
        assert_eq!(err.kind, PlatformErrorKind::JobNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_jobs_are_evicted_after_retention() {
        let table = JobTable::with_retention(Duration::from_secs(60));
        let done = table.insert("j");
        let done_handle = done.handle.clone();
        let live = table.insert("j");
        done.finish(JobState::Succeeded);
        assert_eq!(table.len(), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(table.state(&done_handle), Some(JobState::Succeeded));

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert_eq!(table.state(&done_handle), None);
        assert_eq!(table.len(), 1);
        assert_eq!(table.state(&live.handle), Some(JobState::Queued));
    }

    #[tokio::test]
    async fn zero_retention_keeps_table_bounded() {
        let table = JobTable::with_retention(Duration::ZERO);
        for _ in 0..50 {
            let slot = table.insert("j");
            slot.running();
            slot.finish(JobState::Failed);
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn handles_are_unique_per_job() {
        let table = JobTable::default();
        let handles: std::collections::HashSet<JobHandle> =
            (0..100).map(|_| table.insert("j").handle).collect();
        assert_eq!(handles.len(), 100);
        assert_eq!(table.len(), 100);
        assert!(handles.iter().all(|h| h.as_str().starts_with("j-")));
    }
}
