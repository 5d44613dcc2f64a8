//! Full lifecycle integration tests.
//!
//! The submitter and the worker share nothing but the task store and an
//! in-process job platform, the same seams a container platform would
//! provide. Covers the async webhook path, the synchronous streaming path,
//! cancellation races and lost-job detection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockito::{Matcher, Server};
use secrecy::SecretString;
use serde_json::{json, Value};
use task_handoff::crypto::{EnvelopeCodec, LocalKms};
use task_handoff::dispatch::{InProcessPlatform, JobDispatcher, JobRequest, JobRunner, JobState};
use task_handoff::executor::{ExecutionOutcome, OutputSink, WorkExecutor, EXIT_CANCELLED};
use task_handoff::logs::StreamerConfig;
use task_handoff::store::{InMemoryBackend, PayloadPointer, StoreError, TaskStore};
use task_handoff::types::{CancelResponse, TaskId, TaskStatus};
use task_handoff::watcher::{WatchError, WatchOptions};
use task_handoff::webhook::WebhookNotifier;
use task_handoff::{HandoffError, SubmitRequest, Submitter, Worker};
use tokio_util::sync::CancellationToken;

const JOB: &str = "handoff-worker";

/// Prints `lines` numbered lines, echoing the prompt first.
struct Chatty {
    lines: usize,
}

#[async_trait]
impl WorkExecutor for Chatty {
    async fn execute(
        &self,
        payload: &Value,
        sink: &dyn OutputSink,
        _cancel: CancellationToken,
    ) -> ExecutionOutcome {
        sink.on_line(payload["prompt"].as_str().unwrap_or("<none>"));
        for i in 1..self.lines {
            sink.on_line(&format!("step {i}"));
        }
        ExecutionOutcome::success()
    }
}

/// Runs until cancelled.
struct Stubborn;

#[async_trait]
impl WorkExecutor for Stubborn {
    async fn execute(
        &self,
        _payload: &Value,
        sink: &dyn OutputSink,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        sink.on_line("working");
        cancel.cancelled().await;
        ExecutionOutcome::failure(EXIT_CANCELLED, "cancelled")
    }
}

/// A job that exits without ever touching the store.
struct Vanishes;

#[async_trait]
impl JobRunner for Vanishes {
    async fn run(&self, _request: JobRequest, _cancel: CancellationToken) -> i32 {
        137
    }
}

struct Harness {
    store: TaskStore,
    platform: Arc<InProcessPlatform>,
    submitter: Submitter,
}

fn harness(executor: Arc<dyn WorkExecutor>, secret: Option<&str>) -> Harness {
    let store = TaskStore::new(Arc::new(InMemoryBackend::new()));
    let codec = EnvelopeCodec::new(Arc::new(LocalKms::generate()));

    let mut worker = Worker::new(store.clone(), codec.clone(), executor).with_streamer_config(
        StreamerConfig {
            max_lines: 100,
            flush_interval: Duration::from_secs(60),
        },
    );
    if let Some(secret) = secret {
        worker = worker.with_notifier(WebhookNotifier::new(SecretString::from(secret)));
    }

    let platform = Arc::new(InProcessPlatform::new().with_runner(JOB, Arc::new(worker)));
    let dispatcher = JobDispatcher::new(platform.clone(), JOB);
    let submitter = Submitter::new(store.clone(), codec, dispatcher).with_watch_options(
        WatchOptions {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            lost_job_grace_ticks: 3,
        },
    );
    Harness {
        store,
        platform,
        submitter,
    }
}

// ─── Async Path ─────────────────────────────────────────────────────────────

mod async_path {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn submit_execute_notify_cleanup() {
        let h = harness(Arc::new(Chatty { lines: 250 }), Some("whsec_e2e"));
        let id = TaskId::parse("e2e-1").unwrap();
        let logs_path = h.store.logs_path(&id);

        let mut server = Server::new_async().await;
        let hook = server
            .mock("POST", "/done")
            .match_body(Matcher::PartialJson(json!({
                "taskId": "e2e-1",
                "status": "completed",
                "exitCode": 0,
                "logsPath": logs_path,
                "metadata": {"requestedBy": "ci"},
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let request = SubmitRequest::asynchronous(
            json!({"prompt": "refactor the parser", "apiToken": "ghp_never_logged"}),
            format!("{}/done", server.url()),
        )
        .with_task_id("e2e-1")
        .with_metadata(json!({"requestedBy": "ci"}).as_object().unwrap().clone());

        let accepted = h.submitter.submit(request).await.unwrap();
        assert_eq!(accepted.task_id, id);
        assert_eq!(accepted.status, TaskStatus::Pending);
        assert_eq!(accepted.logs_path, logs_path);

        let handle = h.submitter.registry().get(&id).unwrap().job_handle;
        assert_eq!(h.platform.wait(&handle).await, Some(JobState::Succeeded));

        let meta = h.store.get_metadata(&id).await.unwrap().unwrap();
        assert_eq!(meta.status, TaskStatus::Completed);
        assert_eq!(meta.exit_code, Some(0));
        assert!(meta.started_at.is_some());
        assert!(meta.completed_at.is_some());

        let chunks = h.store.list_log_chunks(&id).await.unwrap();
        assert_eq!(chunks.len(), 3);
        let first = h.store.read_chunk(&id, &chunks[0]).await.unwrap();
        assert_eq!(first[0].line, "refactor the parser");

        assert!(matches!(
            h.store
                .get_encrypted_payload(&PayloadPointer::for_task(&id))
                .await,
            Err(StoreError::PayloadNotFound { .. })
        ));
        hook.assert_async().await;

        assert!(h.submitter.finish(&id));
    }

    #[tokio::test]
    async fn worker_without_secret_still_completes() {
        let h = harness(Arc::new(Chatty { lines: 2 }), None);
        let accepted = h
            .submitter
            .submit(SubmitRequest::asynchronous(
                json!({"prompt": "p"}),
                "http://127.0.0.1:9/never",
            ))
            .await
            .unwrap();
        let handle = h
            .submitter
            .registry()
            .get(&accepted.task_id)
            .unwrap()
            .job_handle;
        h.platform.wait(&handle).await;
        let meta = h.store.get_metadata(&accepted.task_id).await.unwrap().unwrap();
        assert_eq!(meta.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn missing_callback_is_rejected_before_anything_is_stored() {
        let h = harness(Arc::new(Chatty { lines: 1 }), None);
        let mut request = SubmitRequest::asynchronous(json!({}), "https://example.com/h")
            .with_task_id("no-hook");
        request.callback_url = None;
        let err = h.submitter.submit(request).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
        let id = TaskId::parse("no-hook").unwrap();
        assert!(h.store.get_metadata(&id).await.unwrap().is_none());
        assert!(h.submitter.registry().is_empty());
    }
}

// ─── Sync Path ──────────────────────────────────────────────────────────────

mod sync_path {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn run_sync_streams_every_line_in_order() {
        let h = harness(Arc::new(Chatty { lines: 120 }), None);
        let mut seen = Vec::new();
        let meta = h
            .submitter
            .run_sync(
                SubmitRequest::sync(json!({"prompt": "hello"})),
                |entry| seen.push(entry.line.clone()),
            )
            .await
            .unwrap();

        assert_eq!(meta.status, TaskStatus::Completed);
        assert_eq!(seen.len(), 120);
        assert_eq!(seen[0], "hello");
        assert_eq!(seen[119], "step 119");
        assert!(h.submitter.registry().is_empty());
    }

    #[tokio::test]
    async fn lost_job_is_reported_before_timeout() {
        let store = TaskStore::new(Arc::new(InMemoryBackend::new()));
        let codec = EnvelopeCodec::new(Arc::new(LocalKms::generate()));
        let platform = Arc::new(InProcessPlatform::new().with_runner(JOB, Arc::new(Vanishes)));
        let submitter = Submitter::new(
            store.clone(),
            codec,
            JobDispatcher::new(platform, JOB),
        )
        .with_watch_options(WatchOptions {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            lost_job_grace_ticks: 3,
        });

        let started = std::time::Instant::now();
        let err = submitter
            .run_sync(SubmitRequest::sync(json!({})).with_task_id("lost"), |_| {})
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            HandoffError::Watch(WatchError::JobLost { task_id, job_state, .. }) => {
                assert_eq!(task_id.as_str(), "lost");
                assert_eq!(job_state, Some(JobState::Failed));
            },
            other => panic!("expected JobLost, got {other:?}"),
        }
        assert!(submitter.registry().is_empty());
    }
}

// ─── Cancellation ───────────────────────────────────────────────────────────

mod cancellation {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn wait_until_running(store: &TaskStore, id: &TaskId) {
        for _ in 0..500 {
            let meta = store.get_metadata(id).await.unwrap().unwrap();
            if meta.status == TaskStatus::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} never started");
    }

    #[tokio::test]
    async fn concurrent_cancels_have_one_winner() {
        let h = harness(Arc::new(Stubborn), None);
        let accepted = h
            .submitter
            .submit(SubmitRequest::sync(json!({})).with_task_id("race"))
            .await
            .unwrap();
        let id = accepted.task_id;
        wait_until_running(&h.store, &id).await;

        let (a, b) = tokio::join!(h.submitter.cancel(&id), h.submitter.cancel(&id));
        let (a, b) = (a.unwrap(), b.unwrap());
        let winners = [&a, &b].iter().filter(|r| r.is_cancelled()).count();
        assert_eq!(winners, 1, "{a:?} / {b:?}");
        assert!([&a, &b].contains(&&CancelResponse::AlreadyCancelling {
            task_id: id.clone()
        }));

        let handle = h.submitter.registry().get(&id).unwrap().job_handle;
        assert_eq!(h.platform.wait(&handle).await, Some(JobState::Cancelled));
        let meta = h.store.get_metadata(&id).await.unwrap().unwrap();
        assert_eq!(meta.status, TaskStatus::Cancelled);
        assert!(meta.cancelled_at.is_some());
    }

    #[tokio::test]
    async fn cancelled_status_survives_worker_shutdown() {
        let h = harness(Arc::new(Stubborn), None);
        let accepted = h
            .submitter
            .submit(SubmitRequest::sync(json!({})).with_task_id("stays-cancelled"))
            .await
            .unwrap();
        let id = accepted.task_id;
        wait_until_running(&h.store, &id).await;

        assert!(h.submitter.cancel(&id).await.unwrap().is_cancelled());
        let handle = h.submitter.registry().get(&id).unwrap().job_handle;
        h.platform.wait(&handle).await;

        let meta = h.store.get_metadata(&id).await.unwrap().unwrap();
        assert_eq!(meta.status, TaskStatus::Cancelled);
        let chunks = h.store.list_log_chunks(&id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(h
            .store
            .get_encrypted_payload(&PayloadPointer::for_task(&id))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn cancelling_a_finished_task_is_not_an_error() {
        let h = harness(Arc::new(Chatty { lines: 1 }), None);
        let accepted = h
            .submitter
            .submit(SubmitRequest::sync(json!({})).with_task_id("done"))
            .await
            .unwrap();
        let id = accepted.task_id;
        let handle = h.submitter.registry().get(&id).unwrap().job_handle;
        h.platform.wait(&handle).await;

        let response = h.submitter.cancel(&id).await.unwrap();
        assert!(!response.is_cancelled());
        assert!(matches!(response, CancelResponse::NotRunning { .. }));
        assert_eq!(
            h.store.get_metadata(&id).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }
}
