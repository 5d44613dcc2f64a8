//! Job dispatch.
//!
//! [`JobDispatcher`] starts, queries and cancels the out-of-process job
//! that runs a task, translating platform errors into [`DispatchError`].
//!
//! Platforms:
//! - [`InProcessPlatform`] - [`JobRunner`]s on Tokio tasks.
//! - [`ProcessPlatform`] - one child process per job.

pub mod local;
pub mod platform;
pub mod process;

use std::sync::Arc;

use thiserror::Error;

use crate::store::PayloadPointer;
use crate::types::TaskId;

pub use local::{InProcessPlatform, JobRunner};
pub use platform::{
    JobHandle, JobPlatform, JobRequest, JobRequestError, JobState, PlatformError,
    PlatformErrorKind, DEFAULT_JOB_RETENTION, PAYLOAD_POINTER_PARAM, TASK_ID_PARAM,
};
pub use process::{JobCommand, ProcessPlatform, DEFAULT_TERMINATION_GRACE};

/// Dispatch failures.
///
/// Only [`JobDefinitionNotFound`](Self::JobDefinitionNotFound) and
/// [`PermissionDenied`](Self::PermissionDenied) point at a deployment
/// mistake; see [`is_configuration_error`](Self::is_configuration_error).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The job definition does not exist on the platform.
    #[error("job definition {job_name} not found: {source}")]
    JobDefinitionNotFound {
        /// Configured job name.
        job_name: String,
        /// Platform error.
        #[source]
        source: PlatformError,
    },

    /// The caller may not run or cancel the job.
    #[error("permission denied for job {job_name}: {source}")]
    PermissionDenied {
        /// Configured job name.
        job_name: String,
        /// Platform error.
        #[source]
        source: PlatformError,
    },

    /// Any other platform failure.
    #[error("job dispatch failed: {source}")]
    Failed {
        /// Platform error.
        #[source]
        source: PlatformError,
    },
}

impl DispatchError {
    /// Returns `true` for errors an operator must fix in the deployment,
    /// as opposed to failures of one task.
    ///
    /// ```
    /// use task_handoff::dispatch::{DispatchError, PlatformError, PlatformErrorKind};
    ///
    /// let err = DispatchError::from_platform(
    ///     "worker",
    ///     PlatformError::new(PlatformErrorKind::PermissionDenied, "denied"),
    /// );
    /// assert!(err.is_configuration_error());
    /// ```
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::JobDefinitionNotFound { .. } | Self::PermissionDenied { .. }
        )
    }

    /// Classifies a platform error.
    pub fn from_platform(job_name: &str, source: PlatformError) -> Self {
        match source.kind {
            PlatformErrorKind::DefinitionNotFound => Self::JobDefinitionNotFound {
                job_name: job_name.to_string(),
                source,
            },
            PlatformErrorKind::PermissionDenied => Self::PermissionDenied {
                job_name: job_name.to_string(),
                source,
            },
            _ => Self::Failed { source },
        }
    }
}

/// Starts and cancels the job definition that runs tasks.
#[derive(Clone)]
pub struct JobDispatcher {
    platform: Arc<dyn JobPlatform>,
    job_name: String,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("job_name", &self.job_name)
            .finish_non_exhaustive()
    }
}

impl JobDispatcher {
    /// Creates a dispatcher running `job_name` on `platform`.
    pub fn new(platform: Arc<dyn JobPlatform>, job_name: impl Into<String>) -> Self {
        Self {
            platform,
            job_name: job_name.into(),
        }
    }

    /// The job definition this dispatcher runs.
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Starts a job for `task_id`. Only the identifier and the payload
    /// pointer are passed to the platform.
    pub async fn dispatch(
        &self,
        task_id: &TaskId,
        payload_pointer: &PayloadPointer,
    ) -> Result<JobHandle, DispatchError> {
        let request = JobRequest::new(task_id.clone(), payload_pointer.clone());
        match self.platform.run_job(&self.job_name, &request).await {
            Ok(handle) => {
                tracing::info!(task_id = %task_id, job = %handle, job_name = %self.job_name, "job dispatched");
                Ok(handle)
            },
            Err(e) => {
                let err = DispatchError::from_platform(&self.job_name, e);
                if err.is_configuration_error() {
                    tracing::error!(task_id = %task_id, job_name = %self.job_name, error = %err, "job dispatch misconfigured");
                } else {
                    tracing::warn!(task_id = %task_id, job_name = %self.job_name, error = %err, "job dispatch failed");
                }
                Err(err)
            },
        }
    }

    /// Requests termination of a job.
    ///
    /// Returns `false` when the job had already finished (or is no longer
    /// known to the platform); that is not an error.
    pub async fn cancel(&self, handle: &JobHandle) -> Result<bool, DispatchError> {
        match self.platform.cancel_job(handle).await {
            Ok(()) => {
                tracing::info!(job = %handle, "job cancellation requested");
                Ok(true)
            },
            Err(e)
                if matches!(
                    e.kind,
                    PlatformErrorKind::AlreadyFinished | PlatformErrorKind::JobNotFound
                ) =>
            {
                tracing::debug!(job = %handle, reason = %e, "job not cancellable");
                Ok(false)
            },
            Err(e) => Err(DispatchError::from_platform(&self.job_name, e)),
        }
    }

    /// Platform-reported state, or `None` if the job is unknown.
    pub async fn status(&self, handle: &JobHandle) -> Result<Option<JobState>, DispatchError> {
        self.platform
            .job_state(handle)
            .await
            .map_err(|e| DispatchError::from_platform(&self.job_name, e))
    }
}
