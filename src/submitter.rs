//! Submitter-side pipeline.
//!
//! [`Submitter::submit`] validates a request, encrypts the payload, stores
//! it with a `pending` status document, dispatches a job that receives
//! only the task identifier and the payload pointer, and records the job
//! in the [`TaskRegistry`].
//!
//! Synchronous callers use [`Submitter::run_sync`], which also tails the
//! task's logs until it reaches a terminal status. Asynchronous callers
//! get a [`SubmissionResponse`] right away and a webhook later.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::crypto::EnvelopeCodec;
use crate::dispatch::JobDispatcher;
use crate::error::{HandoffError, ValidationError};
use crate::logs::LogEntry;
use crate::registry::{CancelAttempt, RegistryError, TaskRegistry};
use crate::store::{PayloadPointer, StoreError, TaskStore};
use crate::types::{
    CancelResponse, NotRunningReason, SubmissionResponse, TaskId, TaskKind, TaskMetadata,
    TaskStatus, TerminalFields,
};
use crate::watcher::{CompletionWatcher, WatchOptions};

/// A unit of work to hand off.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    /// Caller-chosen identifier; generated when `None`.
    pub task_id: Option<String>,
    /// Sync or async delivery.
    pub kind: TaskKind,
    /// Work description. Encrypted before it leaves this process.
    pub payload: Value,
    /// Webhook target. Required for async, rejected for sync.
    pub callback_url: Option<String>,
    /// Caller-opaque map echoed back in the terminal result.
    pub metadata: Option<Map<String, Value>>,
}

impl SubmitRequest {
    /// A synchronous request.
    pub fn sync(payload: Value) -> Self {
        Self {
            task_id: None,
            kind: TaskKind::Sync,
            payload,
            callback_url: None,
            metadata: None,
        }
    }

    /// An asynchronous request delivering its result to `callback_url`.
    pub fn asynchronous(payload: Value, callback_url: impl Into<String>) -> Self {
        Self {
            task_id: None,
            kind: TaskKind::Async,
            payload,
            callback_url: Some(callback_url.into()),
            metadata: None,
        }
    }

    /// Uses a caller-chosen task identifier.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Attaches caller metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn validate(&self) -> Result<TaskId, ValidationError> {
        let task_id = match &self.task_id {
            Some(raw) => TaskId::parse(raw.as_str())?,
            None => TaskId::generate(),
        };
        match (self.kind, self.callback_url.as_deref()) {
            (TaskKind::Async, None) => Err(ValidationError::MissingCallbackUrl),
            (TaskKind::Sync, Some(_)) => Err(ValidationError::CallbackNotAllowed),
            (TaskKind::Async, Some(url)) => {
                let invalid = |reason: String| ValidationError::InvalidCallbackUrl {
                    url: url.to_string(),
                    reason,
                };
                let parsed = url::Url::parse(url).map_err(|e| invalid(e.to_string()))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(invalid(format!("unsupported scheme {}", parsed.scheme())));
                }
                if parsed.host_str().is_none() {
                    return Err(invalid("missing host".to_string()));
                }
                Ok(task_id)
            },
            (TaskKind::Sync, None) => Ok(task_id),
        }
    }
}

/// Entry point of the submitting process.
#[derive(Clone)]
pub struct Submitter {
    store: TaskStore,
    codec: EnvelopeCodec,
    dispatcher: JobDispatcher,
    registry: Arc<TaskRegistry>,
    watch_options: WatchOptions,
}

impl std::fmt::Debug for Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter")
            .field("dispatcher", &self.dispatcher)
            .field("registered", &self.registry.len())
            .field("watch_options", &self.watch_options)
            .finish_non_exhaustive()
    }
}

impl Submitter {
    /// Creates a submitter with its own empty registry.
    pub fn new(store: TaskStore, codec: EnvelopeCodec, dispatcher: JobDispatcher) -> Self {
        Self {
            store,
            codec,
            dispatcher,
            registry: Arc::new(TaskRegistry::new()),
            watch_options: WatchOptions::default(),
        }
    }

    /// Shares an existing registry.
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the polling parameters used by [`run_sync`](Self::run_sync).
    pub fn with_watch_options(mut self, options: WatchOptions) -> Self {
        self.watch_options = options;
        self
    }

    /// The registry tracking this process's tasks.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Hands a task off to a job.
    ///
    /// # Errors
    ///
    /// - [`HandoffError::Validation`] for bad input; nothing is written.
    /// - [`HandoffError::Store`] with [`StoreError::AlreadyExists`] when
    ///   the task identifier is taken. The existing task's payload and
    ///   status document are left untouched.
    /// - [`HandoffError::Dispatch`] when the job could not be started. The
    ///   payload is deleted and the task is marked `failed` first.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmissionResponse, HandoffError> {
        let task_id = request.validate()?;
        let envelope = self.codec.encrypt(&request.payload).await?;
        drop(request.payload);

        // The status document reserves the identifier. The payload key is
        // only written by whoever won that reservation.
        let metadata = TaskMetadata::pending(
            task_id.clone(),
            request.kind,
            request.callback_url,
            request.metadata,
            PayloadPointer::for_task(&task_id).to_string(),
        );
        self.store.create_metadata(&metadata).await?;

        let pointer = match self.store.put_encrypted_payload(&task_id, &envelope).await {
            Ok(pointer) => pointer,
            Err(e) => {
                self.record_failure(&task_id, e.to_string()).await;
                return Err(e.into());
            },
        };

        let handle = match self.dispatcher.dispatch(&task_id, &pointer).await {
            Ok(handle) => handle,
            Err(e) => {
                self.discard_payload(&task_id).await;
                self.record_failure(&task_id, e.to_string()).await;
                return Err(e.into());
            },
        };

        if let Err(RegistryError::Duplicate { task_id }) =
            self.registry.register(task_id.clone(), handle, request.kind)
        {
            tracing::warn!(task_id = %task_id, "task was already registered, keeping first job");
        }

        tracing::info!(task_id = %task_id, kind = %request.kind, "task submitted");
        Ok(SubmissionResponse {
            task_id: task_id.clone(),
            status: TaskStatus::Pending,
            logs_path: self.store.logs_path(&task_id),
            created_at: metadata.created_at,
        })
    }

    /// Submits a task and follows it to a terminal status.
    ///
    /// `on_line` receives the task's log lines in write order. The task is
    /// unregistered when this returns, whatever the outcome. A `failed`
    /// task is returned as `Ok`; inspect the status document.
    pub async fn run_sync<F>(
        &self,
        request: SubmitRequest,
        on_line: F,
    ) -> Result<TaskMetadata, HandoffError>
    where
        F: FnMut(&LogEntry),
    {
        let response = self.submit(request).await?;
        let task_id = response.task_id;

        let mut watcher = CompletionWatcher::new(self.store.clone());
        if let Some(entry) = self.registry.get(&task_id) {
            watcher = watcher.with_job_check(self.dispatcher.clone(), entry.job_handle);
        }
        let result = watcher.watch(&task_id, on_line, self.watch_options).await;
        self.registry.unregister(&task_id);
        Ok(result?)
    }

    /// Requests cancellation of a task dispatched by this process.
    ///
    /// The status document is moved to `cancelled` only after the job
    /// platform accepted the termination request. Unknown and finished
    /// tasks are reported as [`CancelResponse::NotRunning`], not errors.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<CancelResponse, HandoffError> {
        let not_running = |reason| CancelResponse::NotRunning {
            task_id: task_id.clone(),
            reason,
        };

        match self.registry.cancel(task_id, &self.dispatcher).await? {
            CancelAttempt::AlreadyCancelling => Ok(CancelResponse::AlreadyCancelling {
                task_id: task_id.clone(),
            }),
            CancelAttempt::JobAlreadyFinished => {
                Ok(not_running(NotRunningReason::AlreadyTerminal))
            },
            CancelAttempt::NotRegistered => {
                let reason = match self.store.get_metadata(task_id).await? {
                    Some(meta) if meta.is_terminal() => NotRunningReason::AlreadyTerminal,
                    _ => NotRunningReason::NotFound,
                };
                Ok(not_running(reason))
            },
            CancelAttempt::Requested => {
                match self
                    .store
                    .transition(task_id, |m| m.mark_cancelled(Utc::now()))
                    .await
                {
                    Ok(_) => {},
                    Err(StoreError::InvalidTransition(e)) => {
                        // The worker may have recorded the cancellation itself.
                        let status = self.store.get_metadata(task_id).await?.map(|m| m.status);
                        if status != Some(TaskStatus::Cancelled) {
                            tracing::info!(task_id = %task_id, error = %e, "task finished before cancellation landed");
                            return Ok(not_running(NotRunningReason::AlreadyTerminal));
                        }
                    },
                    Err(e) => return Err(e.into()),
                }
                self.discard_payload(task_id).await;
                tracing::info!(task_id = %task_id, "task cancelled");
                Ok(CancelResponse::Cancelled {
                    task_id: task_id.clone(),
                    status: TaskStatus::Cancelled,
                })
            },
        }
    }

    /// Current status document, if any.
    pub async fn status(&self, task_id: &TaskId) -> Result<Option<TaskMetadata>, HandoffError> {
        Ok(self.store.get_metadata(task_id).await?)
    }

    /// Drops this process's bookkeeping for a task. Returns `true` if it
    /// was registered.
    pub fn finish(&self, task_id: &TaskId) -> bool {
        self.registry.unregister(task_id)
    }

    async fn record_failure(&self, task_id: &TaskId, reason: String) {
        let fields = TerminalFields {
            error: Some(reason),
            ..TerminalFields::default()
        };
        if let Err(e) = self
            .store
            .transition(task_id, |m| {
                m.mark_terminal(TaskStatus::Failed, fields, Utc::now())
            })
            .await
        {
            tracing::warn!(task_id = %task_id, error = %e, "failed to record submission failure");
        }
    }

    async fn discard_payload(&self, task_id: &TaskId) {
        if let Err(e) = self.store.delete_encrypted_payload(task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "failed to delete encrypted payload");
        }
    }
}
