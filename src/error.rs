//! Top-level error taxonomy.
//!
//! Each component has its own error enum. [`HandoffError`] composes them
//! for callers that drive a whole submission, and maps each class to the
//! HTTP status a front end should answer with via
//! [`http_status`](HandoffError::http_status).

use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::EnvelopeError;
use crate::dispatch::DispatchError;
use crate::registry::RegistryError;
use crate::store::StoreError;
use crate::types::TaskIdError;
use crate::watcher::WatchError;
use crate::worker::WorkerError;

/// Submission input rejected before anything is stored or dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The caller-supplied task identifier is malformed.
    #[error(transparent)]
    InvalidTaskId(#[from] TaskIdError),

    /// Async tasks need somewhere to deliver the result.
    #[error("async tasks require a callback URL")]
    MissingCallbackUrl,

    /// Sync tasks stream their result to the caller instead.
    #[error("sync tasks do not accept a callback URL")]
    CallbackNotAllowed,

    /// The callback URL is not an absolute http(s) URL.
    #[error("invalid callback URL {url:?}: {reason}")]
    InvalidCallbackUrl {
        /// The rejected URL.
        url: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Any failure of the handoff pipeline.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// Bad input.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Payload encryption or decryption failed.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// The task store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The job could not be started or cancelled.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Task bookkeeping rejected the task.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Completion was not observed.
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// The worker refused or failed the job.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HandoffError {
    /// HTTP status for a synchronous error response.
    ///
    /// # Examples
    ///
    /// ```
    /// use task_handoff::error::{HandoffError, ValidationError};
    ///
    /// let err = HandoffError::from(ValidationError::MissingCallbackUrl);
    /// assert_eq!(err.http_status(), 400);
    /// ```
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Store(StoreError::AlreadyExists { .. }) | Self::Registry(_) => 409,
            Self::Store(StoreError::TaskNotFound { .. }) => 404,
            Self::Dispatch(e) if !e.is_configuration_error() => 503,
            Self::Watch(WatchError::Timeout { .. }) => 504,
            Self::Watch(WatchError::JobLost { .. }) => 502,
            Self::Envelope(_)
            | Self::Store(_)
            | Self::Dispatch(_)
            | Self::Worker(_)
            | Self::Config(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{JobHandle, PlatformError, PlatformErrorKind};
    use crate::types::TaskId;
    use std::time::Duration;

    #[test]
    fn status_classes() {
        let id = TaskId::parse("e1").unwrap();
        assert_eq!(
            HandoffError::from(ValidationError::from(TaskIdError::Empty)).http_status(),
            400
        );
        assert_eq!(
            HandoffError::from(StoreError::AlreadyExists {
                task_id: id.clone()
            })
            .http_status(),
            409
        );
        assert_eq!(
            HandoffError::from(DispatchError::from_platform(
                "job",
                PlatformError::new(PlatformErrorKind::PermissionDenied, "denied"),
            ))
            .http_status(),
            500
        );
        assert_eq!(
            HandoffError::from(DispatchError::from_platform(
                "job",
                PlatformError::new(PlatformErrorKind::Other, "throttled"),
            ))
            .http_status(),
            503
        );
        assert_eq!(
            HandoffError::from(WatchError::Timeout {
                task_id: id.clone(),
                timeout: Duration::from_secs(1),
            })
            .http_status(),
            504
        );
        assert_eq!(
            HandoffError::from(WatchError::JobLost {
                task_id: id,
                job_handle: JobHandle::new("j"),
                job_state: None,
            })
            .http_status(),
            502
        );
    }

    #[test]
    fn messages_pass_through() {
        let err = HandoffError::from(ValidationError::InvalidCallbackUrl {
            url: "ftp://x".into(),
            reason: "unsupported scheme".into(),
        });
        assert!(err.to_string().contains("ftp://x"));
    }
}
