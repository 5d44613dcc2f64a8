//! Job-side pipeline.
//!
//! A [`Worker`] handles one [`JobRequest`]:
//!
//! 1. read the status document, which must exist and be `pending`;
//! 2. fetch and decrypt the payload (failure marks the task `failed`);
//! 3. mark the task `running`;
//! 4. execute the work with a [`LogStreamer`] as output sink;
//! 5. end the streamer, waiting for every chunk;
//! 6. mark the task `completed` or `failed` (`cancelled` if the job was
//!    cancelled), unless it is already terminal;
//! 7. for `async` tasks, deliver the signed webhook once;
//! 8. delete the encrypted payload.
//!
//! If step 1 fails the worker stops without writing anything.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::crypto::EnvelopeCodec;
use crate::dispatch::{JobRequest, JobRunner};
use crate::executor::{ExecutionOutcome, WorkExecutor, EXIT_CANCELLED};
use crate::logs::{LogStreamError, LogStreamer, StreamSummary, StreamerConfig};
use crate::store::{PayloadPointer, StoreError, TaskStore};
use crate::types::{
    TaskId, TaskKind, TaskMetadata, TaskStatus, TerminalFields, TerminalResult,
};
use crate::webhook::{DeliveryOutcome, WebhookNotifier};

/// Reasons a worker refuses or fails to handle a job.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// No status document exists for the task.
    #[error("task {task_id} has no status document")]
    TaskNotFound {
        /// Requested task.
        task_id: TaskId,
    },

    /// The task is not waiting to be run.
    #[error("task {task_id} is {status}, expected pending")]
    NotPending {
        /// Requested task.
        task_id: TaskId,
        /// Current status.
        status: TaskStatus,
    },

    /// The job's payload pointer does not match the status document.
    #[error("payload pointer {requested} does not belong to task {task_id}")]
    PointerMismatch {
        /// Requested task.
        task_id: TaskId,
        /// Pointer received with the job.
        requested: PayloadPointer,
    },

    /// The store failed while recording progress.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a finished run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    /// The task handled.
    pub task_id: TaskId,
    /// Terminal status in the store after the run.
    pub status: TaskStatus,
    /// Exit code recorded in the status document.
    pub exit_code: Option<i32>,
    /// Log streaming totals; `None` if nothing was executed.
    pub logs: Option<StreamSummary>,
    /// Webhook result; `None` for sync tasks.
    pub webhook: Option<DeliveryOutcome>,
    /// Whether the encrypted payload was removed by this run.
    pub payload_deleted: bool,
}

impl WorkerOutcome {
    /// Exit code for the hosting process.
    pub fn process_exit_code(&self) -> i32 {
        match self.status {
            TaskStatus::Completed => 0,
            TaskStatus::Cancelled => EXIT_CANCELLED,
            _ => match self.exit_code {
                Some(code) if code != 0 => code,
                _ => 1,
            },
        }
    }
}

/// Runs tasks handed over by a job platform.
#[derive(Clone)]
pub struct Worker {
    store: TaskStore,
    codec: EnvelopeCodec,
    executor: Arc<dyn WorkExecutor>,
    notifier: Option<WebhookNotifier>,
    streamer_config: StreamerConfig,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("notifier", &self.notifier)
            .field("streamer_config", &self.streamer_config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Creates a worker. Without a notifier, async tasks finish without a
    /// webhook (and a warning is logged).
    pub fn new(store: TaskStore, codec: EnvelopeCodec, executor: Arc<dyn WorkExecutor>) -> Self {
        Self {
            store,
            codec,
            executor,
            notifier: None,
            streamer_config: StreamerConfig::default(),
        }
    }

    /// Sets the webhook notifier for async tasks.
    pub fn with_notifier(mut self, notifier: WebhookNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Sets the log chunking triggers.
    pub fn with_streamer_config(mut self, config: StreamerConfig) -> Self {
        self.streamer_config = config;
        self
    }

    /// Handles one job to completion.
    ///
    /// # Errors
    ///
    /// [`WorkerError::TaskNotFound`], [`WorkerError::NotPending`] and
    /// [`WorkerError::PointerMismatch`] are raised before anything is
    /// written. [`WorkerError::Store`] means a status write failed.
    pub async fn run(
        &self,
        request: &JobRequest,
        cancel: CancellationToken,
    ) -> Result<WorkerOutcome, WorkerError> {
        let task_id = &request.task_id;
        let metadata = self
            .store
            .get_metadata(task_id)
            .await?
            .ok_or_else(|| WorkerError::TaskNotFound {
                task_id: task_id.clone(),
            })?;
        if metadata.status != TaskStatus::Pending {
            return Err(WorkerError::NotPending {
                task_id: task_id.clone(),
                status: metadata.status,
            });
        }
        if metadata.payload_pointer != request.payload_pointer.as_str() {
            return Err(WorkerError::PointerMismatch {
                task_id: task_id.clone(),
                requested: request.payload_pointer.clone(),
            });
        }
        tracing::info!(task_id = %task_id, kind = %metadata.kind, "worker picked up task");

        let (final_meta, logs) = match self.load_payload(&request.payload_pointer).await {
            Ok(payload) => self.execute(task_id, payload, cancel).await?,
            Err(reason) => {
                tracing::error!(task_id = %task_id, reason = %reason, "payload unavailable, failing task");
                let fields = TerminalFields {
                    error: Some(reason),
                    ..TerminalFields::default()
                };
                (self.finish(task_id, TaskStatus::Failed, fields).await?, None)
            },
        };

        let webhook = match final_meta.kind {
            TaskKind::Async => Some(self.notify(&final_meta).await),
            TaskKind::Sync => None,
        };

        let payload_deleted = match self.store.delete_encrypted_payload(task_id).await {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "failed to delete encrypted payload");
                false
            },
        };

        tracing::info!(task_id = %task_id, status = %final_meta.status, exit_code = ?final_meta.exit_code, "worker finished task");
        Ok(WorkerOutcome {
            task_id: task_id.clone(),
            status: final_meta.status,
            exit_code: final_meta.exit_code,
            logs,
            webhook,
            payload_deleted,
        })
    }

    async fn load_payload(&self, pointer: &PayloadPointer) -> Result<Value, String> {
        let envelope = self
            .store
            .get_encrypted_payload(pointer)
            .await
            .map_err(|e| format!("failed to read encrypted payload: {e}"))?;
        self.codec
            .decrypt(&envelope)
            .await
            .map_err(|e| format!("failed to decrypt payload: {e}"))
    }

    async fn execute(
        &self,
        task_id: &TaskId,
        payload: Value,
        cancel: CancellationToken,
    ) -> Result<(TaskMetadata, Option<StreamSummary>), WorkerError> {
        match self
            .store
            .transition(task_id, |m| m.mark_running(Utc::now()))
            .await
        {
            Ok(_) => {},
            Err(StoreError::InvalidTransition(e)) => {
                // Cancelled between dispatch and start.
                tracing::info!(task_id = %task_id, error = %e, "task left pending before start");
                return Ok((self.current(task_id).await?, None));
            },
            Err(e) => return Err(e.into()),
        }

        let streamer = LogStreamer::new(self.store.clone(), task_id.clone(), self.streamer_config);
        let outcome = self
            .executor
            .execute(&payload, &streamer, cancel.clone())
            .await;
        drop(payload);

        let summary = match streamer.end().await {
            Ok(summary) => summary,
            Err(LogStreamError::ChunksLost { summary, lost_lines, .. }) => {
                tracing::error!(task_id = %task_id, lost_lines, "task output partially lost");
                summary
            },
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "log streamer failed");
                StreamSummary::default()
            },
        };

        let ExecutionOutcome {
            exit_code,
            error,
            turns,
        } = outcome;
        let status = if cancel.is_cancelled() {
            TaskStatus::Cancelled
        } else if exit_code == 0 && error.is_none() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let fields = TerminalFields {
            exit_code: Some(exit_code),
            error,
            turns,
            errors: (summary.error_lines > 0).then_some(summary.error_lines),
        };
        Ok((self.finish(task_id, status, fields).await?, Some(summary)))
    }

    /// Writes the terminal status unless another party already did.
    async fn finish(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        fields: TerminalFields,
    ) -> Result<TaskMetadata, WorkerError> {
        match self
            .store
            .transition(task_id, |m| m.mark_terminal(status, fields, Utc::now()))
            .await
        {
            Ok(meta) => Ok(meta),
            Err(StoreError::InvalidTransition(e)) => {
                tracing::info!(task_id = %task_id, error = %e, "task already terminal, keeping stored status");
                self.current(task_id).await
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn current(&self, task_id: &TaskId) -> Result<TaskMetadata, WorkerError> {
        self.store
            .get_metadata(task_id)
            .await?
            .ok_or_else(|| WorkerError::TaskNotFound {
                task_id: task_id.clone(),
            })
    }

    async fn notify(&self, meta: &TaskMetadata) -> DeliveryOutcome {
        let Some(url) = meta.callback_url.as_deref() else {
            return DeliveryOutcome::Failed {
                reason: "async task has no callback URL".to_string(),
            };
        };
        let Some(notifier) = &self.notifier else {
            tracing::warn!(task_id = %meta.task_id, "no webhook secret configured, skipping webhook");
            return DeliveryOutcome::Failed {
                reason: "no webhook notifier configured".to_string(),
            };
        };
        let logs_path = self.store.logs_path(&meta.task_id);
        match TerminalResult::from_metadata(meta, logs_path) {
            Some(result) => notifier.notify(url, &result).await,
            None => DeliveryOutcome::Failed {
                reason: format!("task is {}, not terminal", meta.status),
            },
        }
    }
}

#[async_trait]
impl JobRunner for Worker {
    async fn run(&self, request: JobRequest, cancel: CancellationToken) -> i32 {
        match Worker::run(self, &request, cancel).await {
            Ok(outcome) => outcome.process_exit_code(),
            Err(e) => {
                tracing::error!(task_id = %request.task_id, error = %e, "worker aborted");
                1
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKms;
    use crate::executor::OutputSink;
    use crate::store::InMemoryBackend;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl WorkExecutor for Echo {
        async fn execute(
            &self,
            payload: &Value,
            sink: &dyn OutputSink,
            _cancel: CancellationToken,
        ) -> ExecutionOutcome {
            sink.on_line(&payload.to_string());
            ExecutionOutcome::success()
        }
    }

    async fn setup(status: Option<TaskStatus>) -> (Worker, TaskStore, JobRequest) {
        let store = TaskStore::new(Arc::new(InMemoryBackend::new()));
        let codec = EnvelopeCodec::new(Arc::new(LocalKms::generate()));
        let id = TaskId::parse("wk").unwrap();
        let envelope = codec.encrypt(&json!({"prompt": "x"})).await.unwrap();
        let pointer = store.put_encrypted_payload(&id, &envelope).await.unwrap();
        if let Some(status) = status {
            let mut meta = TaskMetadata::pending(
                id.clone(),
                TaskKind::Sync,
                None,
                None,
                pointer.to_string(),
            );
            meta.status = status;
            store.put_metadata(&meta).await.unwrap();
        }
        let worker = Worker::new(store.clone(), codec, Arc::new(Echo));
        (worker, store, JobRequest::new(id, pointer))
    }

    #[tokio::test]
    async fn sync_task_runs_to_completion() {
        let (worker, store, request) = setup(Some(TaskStatus::Pending)).await;
        let outcome = worker.run(&request, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.webhook.is_none());
        assert!(outcome.payload_deleted);
        assert_eq!(outcome.process_exit_code(), 0);

        let meta = store.get_metadata(&request.task_id).await.unwrap().unwrap();
        assert!(meta.started_at.is_some());
        assert!(meta.summary.is_some());
    }

    #[tokio::test]
    async fn refuses_non_pending_without_writes() {
        let (worker, store, request) = setup(Some(TaskStatus::Running)).await;
        let err = worker.run(&request, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::NotPending { .. }));
        assert!(store
            .get_encrypted_payload(&request.payload_pointer)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn missing_metadata_aborts() {
        let (worker, _, request) = setup(None).await;
        assert!(matches!(
            worker.run(&request, CancellationToken::new()).await,
            Err(WorkerError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn undecryptable_payload_fails_task() {
        let (_, store, request) = setup(Some(TaskStatus::Pending)).await;
        let other_key = EnvelopeCodec::new(Arc::new(LocalKms::generate()));
        let worker = Worker::new(store.clone(), other_key, Arc::new(Echo));
        let outcome = worker.run(&request, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert!(outcome.logs.is_none());
        let meta = store.get_metadata(&request.task_id).await.unwrap().unwrap();
        assert!(meta.error.unwrap().contains("decrypt"));
        assert!(meta.started_at.is_none());
    }
}
