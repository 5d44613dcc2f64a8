//! Completion detection by polling the task store.
//!
//! The submitter has no channel to the worker. [`CompletionWatcher`] tails
//! the store instead: every tick it forwards log chunks it has not seen and
//! reads the status document, until the status is terminal or the timeout
//! elapses.
//!
//! Chunks are consumed contiguously by sequence number. If chunk 4 is
//! visible before chunk 3, the watcher waits for 3. Once a terminal status
//! is observed, a final drain forwards everything left, skipping gaps that
//! will never fill.
//!
//! A watcher can also check the job itself. When the store shows no terminal
//! status but the platform reports the job finished or unknown for several
//! consecutive ticks, the task is reported as [`WatchError::JobLost`]
//! instead of waiting out the full timeout.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::time::Instant;

use crate::dispatch::{JobDispatcher, JobHandle, JobState};
use crate::logs::LogEntry;
use crate::store::{StoreError, TaskStore};
use crate::types::{TaskId, TaskMetadata};

/// Chunk reads in flight during one drain.
const CHUNK_READ_AHEAD: usize = 4;

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Give up after this long without a terminal status.
    pub timeout: Duration,
    /// Pause between ticks.
    pub poll_interval: Duration,
    /// Consecutive ticks the job may look finished while the status is not
    /// terminal before the task counts as lost. Zero disables the check.
    pub lost_job_grace_ticks: u32,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(1),
            lost_job_grace_ticks: 5,
        }
    }
}

/// Why a watch ended without a terminal status.
#[derive(Debug, Error)]
pub enum WatchError {
    /// No terminal status within the timeout.
    #[error("task {task_id} did not finish within {timeout:?}")]
    Timeout {
        /// Watched task.
        task_id: TaskId,
        /// Configured timeout.
        timeout: Duration,
    },

    /// The job is gone but the task never reached a terminal status.
    #[error("job {job_handle} for task {task_id} ended without a terminal status (platform state: {})", .job_state.map_or_else(|| "unknown".to_string(), |s| s.to_string()))]
    JobLost {
        /// Watched task.
        task_id: TaskId,
        /// Checked job.
        job_handle: JobHandle,
        /// Last platform-reported state, `None` if the job was unknown.
        job_state: Option<JobState>,
    },
}

/// Tails a task's status document and log chunks.
#[derive(Debug, Clone)]
pub struct CompletionWatcher {
    store: TaskStore,
    job: Option<(JobDispatcher, JobHandle)>,
}

impl CompletionWatcher {
    /// Creates a watcher that only reads the store.
    pub fn new(store: TaskStore) -> Self {
        Self { store, job: None }
    }

    /// Enables lost-job detection against `handle`.
    pub fn with_job_check(mut self, dispatcher: JobDispatcher, handle: JobHandle) -> Self {
        self.job = Some((dispatcher, handle));
        self
    }

    /// Polls until `task_id` reaches a terminal status and returns it.
    ///
    /// `on_line` receives every log entry in write order, including
    /// trailing chunks written just before the terminal status.
    ///
    /// # Errors
    ///
    /// - [`WatchError::Timeout`] after `options.timeout`.
    /// - [`WatchError::JobLost`] when the platform reports the job gone.
    ///
    /// Store read failures are logged and retried on the next tick.
    pub async fn watch<F>(
        &self,
        task_id: &TaskId,
        mut on_line: F,
        options: WatchOptions,
    ) -> Result<TaskMetadata, WatchError>
    where
        F: FnMut(&LogEntry),
    {
        let deadline = Instant::now() + options.timeout;
        let mut next_seq = 1u32;
        let mut lost_ticks = 0u32;

        loop {
            if let Err(e) = self
                .drain(task_id, &mut next_seq, &mut on_line, false)
                .await
            {
                tracing::warn!(task_id = %task_id, error = %e, "log read failed, retrying next tick");
            }

            match self.store.get_metadata(task_id).await {
                Ok(Some(meta)) if meta.is_terminal() => {
                    self.final_drain(task_id, &mut next_seq, &mut on_line, deadline, options)
                        .await;
                    tracing::debug!(task_id = %task_id, status = %meta.status, "task reached terminal status");
                    return Ok(meta);
                },
                Ok(_) => {
                    if let Some(job_state) = self.check_job(task_id, &mut lost_ticks).await {
                        if options.lost_job_grace_ticks > 0
                            && lost_ticks >= options.lost_job_grace_ticks
                        {
                            self.final_drain(task_id, &mut next_seq, &mut on_line, deadline, options)
                                .await;
                            let job_handle = self
                                .job
                                .as_ref()
                                .map(|(_, h)| h.clone())
                                .unwrap_or_else(|| JobHandle::new("unknown"));
                            tracing::warn!(task_id = %task_id, job = %job_handle, "job ended without terminal status");
                            return Err(WatchError::JobLost {
                                task_id: task_id.clone(),
                                job_handle,
                                job_state,
                            });
                        }
                    }
                },
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "status read failed, retrying next tick");
                },
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(task_id = %task_id, timeout = ?options.timeout, "watch timed out");
                return Err(WatchError::Timeout {
                    task_id: task_id.clone(),
                    timeout: options.timeout,
                });
            }
            tokio::time::sleep(options.poll_interval.min(deadline - now)).await;
        }
    }

    /// Asks the platform about the job. Returns `Some(state)` when the job looks gone
    /// on this tick, after bumping `lost_ticks`.
    async fn check_job(&self, task_id: &TaskId, lost_ticks: &mut u32) -> Option<Option<JobState>> {
        let (dispatcher, handle) = self.job.as_ref()?;
        match dispatcher.status(handle).await {
            Ok(state) if state.map_or(true, |s| s.is_finished()) => {
                *lost_ticks += 1;
                tracing::debug!(task_id = %task_id, job = %handle, ticks = *lost_ticks, "job finished before terminal status");
                Some(state)
            },
            Ok(_) => {
                *lost_ticks = 0;
                None
            },
            Err(e) => {
                tracing::warn!(task_id = %task_id, job = %handle, error = %e, "job status check failed");
                None
            },
        }
    }

    /// Forwards trailing chunks, retrying read failures until `deadline`.
    async fn final_drain<F>(
        &self,
        task_id: &TaskId,
        next_seq: &mut u32,
        on_line: &mut F,
        deadline: Instant,
        options: WatchOptions,
    ) where
        F: FnMut(&LogEntry),
    {
        loop {
            match self.drain(task_id, next_seq, on_line, true).await {
                Ok(()) => return,
                Err(e) if Instant::now() < deadline => {
                    tracing::warn!(task_id = %task_id, error = %e, "final log read failed, retrying");
                    tokio::time::sleep(options.poll_interval).await;
                },
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "giving up on trailing logs");
                    return;
                },
            }
        }
    }

    /// Forwards chunks from `next_seq` on.
    ///
    /// Without `skip_gaps` it stops at the first missing sequence number.
    async fn drain<F>(
        &self,
        task_id: &TaskId,
        next_seq: &mut u32,
        on_line: &mut F,
        skip_gaps: bool,
    ) -> Result<(), StoreError>
    where
        F: FnMut(&LogEntry),
    {
        let mut expected = *next_seq;
        let mut batch = Vec::new();
        for chunk in self.store.list_log_chunks(task_id).await? {
            if chunk.seq < expected {
                continue;
            }
            if chunk.seq != expected {
                if !skip_gaps {
                    break;
                }
                tracing::warn!(task_id = %task_id, expected, found = chunk.seq, "log chunks missing");
            }
            expected = chunk.seq + 1;
            batch.push(chunk);
        }

        // Fetch ahead, forward in sequence order.
        let mut reads = stream::iter(batch)
            .map(|chunk| async move {
                let entries = self.store.read_chunk(task_id, &chunk).await;
                (chunk.seq, entries)
            })
            .buffered(CHUNK_READ_AHEAD);
        while let Some((seq, entries)) = reads.next().await {
            for entry in entries? {
                on_line(&entry);
            }
            *next_seq = seq + 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChunkName, InMemoryBackend, PayloadPointer};
    use crate::types::{TaskKind, TaskStatus};
    use chrono::Utc;
    use std::sync::Arc;

    fn setup() -> (TaskStore, TaskMetadata) {
        let store = TaskStore::new(Arc::new(InMemoryBackend::new()));
        let id = TaskId::parse("w").unwrap();
        let ptr = PayloadPointer::for_task(&id).to_string();
        (store, TaskMetadata::pending(id, TaskKind::Sync, None, None, ptr))
    }

    fn fast() -> WatchOptions {
        WatchOptions {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            lost_job_grace_ticks: 0,
        }
    }

    #[tokio::test]
    async fn waits_for_missing_chunk_until_terminal() {
        let (store, mut meta) = setup();
        store.create_metadata(&meta).await.unwrap();
        let id = meta.task_id.clone();
        store
            .write_chunk(&id, &ChunkName::new(2, 2), &[LogEntry::stdout("second")])
            .await
            .unwrap();
        meta.mark_terminal(TaskStatus::Completed, Default::default(), Utc::now())
            .unwrap();
        store.put_metadata(&meta).await.unwrap();

        let mut seen = Vec::new();
        let final_meta = CompletionWatcher::new(store)
            .watch(&id, |e| seen.push(e.line.clone()), fast())
            .await
            .unwrap();
        assert_eq!(final_meta.status, TaskStatus::Completed);
        assert_eq!(seen, vec!["second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_terminal() {
        let (store, meta) = setup();
        store.create_metadata(&meta).await.unwrap();
        let started = Instant::now();
        let err = CompletionWatcher::new(store)
            .watch(&meta.task_id, |_| {}, WatchOptions {
                timeout: Duration::from_millis(500),
                ..fast()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Timeout { .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(600));
    }
}
