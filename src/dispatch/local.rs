//! In-process job platform.
//!
//! [`InProcessPlatform`] runs registered [`JobRunner`]s on Tokio tasks. It
//! behaves like a remote platform from the submitter's point of view: the
//! runner receives only the [`JobRequest`] and must go through the store
//! for everything else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::platform::{
    JobHandle, JobPlatform, JobRequest, JobState, JobTable, PlatformError, PlatformErrorKind,
};

/// Body of an in-process job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Runs one job to completion and returns its exit code.
    ///
    /// `cancel` fires when the platform is asked to terminate the job.
    async fn run(&self, request: JobRequest, cancel: CancellationToken) -> i32;
}

/// Job platform that runs jobs as Tokio tasks in this process.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use tokio_util::sync::CancellationToken;
/// use task_handoff::dispatch::{InProcessPlatform, JobRequest, JobRunner};
///
/// struct Noop;
///
/// #[async_trait]
/// impl JobRunner for Noop {
///     async fn run(&self, _request: JobRequest, _cancel: CancellationToken) -> i32 {
///         0
///     }
/// }
///
/// let platform = InProcessPlatform::new().with_runner("noop", Arc::new(Noop));
/// assert!(platform.has_runner("noop"));
/// ```
#[derive(Default)]
pub struct InProcessPlatform {
    runners: DashMap<String, Arc<dyn JobRunner>>,
    jobs: JobTable,
}

impl std::fmt::Debug for InProcessPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessPlatform")
            .field("runners", &self.runners.len())
            .finish_non_exhaustive()
    }
}

impl InProcessPlatform {
    /// Creates a platform with no job definitions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `runner` as the job definition `job_name`.
    pub fn with_runner(self, job_name: impl Into<String>, runner: Arc<dyn JobRunner>) -> Self {
        self.register_runner(job_name, runner);
        self
    }

    /// Registers or replaces a job definition.
    pub fn register_runner(&self, job_name: impl Into<String>, runner: Arc<dyn JobRunner>) {
        self.runners.insert(job_name.into(), runner);
    }

    /// Returns `true` if a job definition named `job_name` exists.
    pub fn has_runner(&self, job_name: &str) -> bool {
        self.runners.contains_key(job_name)
    }

    /// Keeps finished jobs queryable for `retention` instead of
    /// [`DEFAULT_JOB_RETENTION`](super::DEFAULT_JOB_RETENTION).
    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.jobs = JobTable::with_retention(retention);
        self
    }

    /// Number of jobs currently tracked, running or within retention.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Waits until the job finishes and returns its final state.
    ///
    /// Returns `None` for unknown or already evicted handles.
    pub async fn wait(&self, handle: &JobHandle) -> Option<JobState> {
        self.jobs.wait(handle).await
    }
}

#[async_trait]
impl JobPlatform for InProcessPlatform {
    async fn run_job(
        &self,
        job_name: &str,
        request: &JobRequest,
    ) -> Result<JobHandle, PlatformError> {
        let runner = self
            .runners
            .get(job_name)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| {
                PlatformError::new(
                    PlatformErrorKind::DefinitionNotFound,
                    format!("no job definition named {job_name}"),
                )
            })?;

        let slot = self.jobs.insert(job_name);
        let handle = slot.handle.clone();
        let request = request.clone();

        tokio::spawn(async move {
            slot.running();
            let exit_code = runner.run(request, slot.cancel.clone()).await;
            let final_state = if slot.cancel.is_cancelled() {
                JobState::Cancelled
            } else if exit_code == 0 {
                JobState::Succeeded
            } else {
                JobState::Failed
            };
            tracing::debug!(job = %slot.handle, exit_code, state = %final_state, "in-process job finished");
            slot.finish(final_state);
        });

        Ok(handle)
    }

    async fn cancel_job(&self, handle: &JobHandle) -> Result<(), PlatformError> {
        self.jobs.cancel(handle)
    }

    async fn job_state(&self, handle: &JobHandle) -> Result<Option<JobState>, PlatformError> {
        Ok(self.jobs.state(handle))
    }
}
