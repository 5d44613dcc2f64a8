//! Chunked log streaming into the task store.
//!
//! [`LogStreamer`] buffers lines and turns them into immutable chunks when
//! either trigger fires:
//!
//! - **size**: the buffer reaches `max_lines`;
//! - **time**: `flush_interval` has passed since a line landed in an empty
//!   buffer.
//!
//! A flush swaps the buffer for an empty one and assigns the next sequence
//! number while holding the state lock, then hands the chunk to a single
//! writer task. The writer persists chunks strictly in sequence order, so a
//! chunk never becomes visible before its predecessor.
//!
//! [`LogStreamer::end`] cancels the timer, flushes what is left and waits
//! for every queued write.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::entry::LogEntry;
use crate::executor::OutputSink;
use crate::store::{ChunkName, StoreError, TaskStore};
use crate::types::TaskId;

/// Default size trigger.
pub const DEFAULT_MAX_LINES: usize = 100;

/// Default time trigger.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(2000);

/// Flush triggers for a [`LogStreamer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamerConfig {
    /// Lines per chunk before a size flush. Zero is treated as one.
    pub max_lines: usize,
    /// Maximum time a buffered line waits before a time flush.
    pub flush_interval: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_MAX_LINES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Errors raised by a [`LogStreamer`].
#[derive(Debug, Error)]
pub enum LogStreamError {
    /// The streamer was already ended.
    #[error("log stream is closed")]
    Closed,

    /// Some chunks could not be written.
    #[error("{lost_chunks} log chunk(s) with {lost_lines} line(s) were not persisted: {first}")]
    ChunksLost {
        /// Number of failed chunk writes.
        lost_chunks: usize,
        /// Lines contained in the failed chunks.
        lost_lines: usize,
        /// Error of the first failed write.
        #[source]
        first: StoreError,
        /// What was persisted despite the failures.
        summary: StreamSummary,
    },

    /// The writer task stopped unexpectedly.
    #[error("log writer task failed: {0}")]
    WriterFailed(String),
}

/// Totals reported by [`LogStreamer::end`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Chunks persisted.
    pub chunks_written: u32,
    /// Lines persisted.
    pub lines_written: usize,
    /// Stderr lines accepted, persisted or not.
    pub error_lines: u32,
}

struct WriteJob {
    chunk: ChunkName,
    entries: Vec<LogEntry>,
}

#[derive(Default)]
struct WriterReport {
    chunks_written: u32,
    lines_written: usize,
    failures: Vec<(usize, StoreError)>,
}

struct State {
    buffer: Vec<LogEntry>,
    next_seq: u32,
    generation: u64,
    error_lines: u32,
    timer: Option<JoinHandle<()>>,
    tx: Option<mpsc::UnboundedSender<WriteJob>>,
    closed: bool,
}

struct Inner {
    task_id: TaskId,
    config: StreamerConfig,
    state: Mutex<State>,
}

impl Inner {
    /// Swaps the buffer out and queues it as the next chunk.
    fn flush_locked(&self, state: &mut State) {
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if state.buffer.is_empty() {
            return;
        }
        let entries = std::mem::take(&mut state.buffer);
        let chunk = ChunkName::new(state.next_seq, Utc::now().timestamp_millis());
        state.next_seq += 1;
        tracing::trace!(task_id = %self.task_id, seq = chunk.seq, lines = entries.len(), "queueing log chunk");
        if let Some(tx) = &state.tx {
            if tx.send(WriteJob { chunk, entries }).is_err() {
                tracing::warn!(task_id = %self.task_id, seq = chunk.seq, "log writer is gone, chunk dropped");
            }
        }
    }
}

/// Buffers output lines and persists them as ordered chunks.
///
/// Must be created inside a Tokio runtime.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use task_handoff::logs::{LogStreamer, StreamerConfig};
/// use task_handoff::store::{InMemoryBackend, TaskStore};
/// use task_handoff::types::TaskId;
///
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let store = TaskStore::new(Arc::new(InMemoryBackend::new()));
/// let id = TaskId::parse("demo").unwrap();
/// let streamer = LogStreamer::new(store.clone(), id.clone(), StreamerConfig::default());
/// streamer.write_line("hello").unwrap();
/// let summary = streamer.end().await.unwrap();
/// assert_eq!(summary.lines_written, 1);
/// assert_eq!(store.list_log_chunks(&id).await.unwrap().len(), 1);
/// # });
/// ```
pub struct LogStreamer {
    inner: Arc<Inner>,
    writer: Mutex<Option<JoinHandle<WriterReport>>>,
}

impl std::fmt::Debug for LogStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStreamer")
            .field("task_id", &self.inner.task_id)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl LogStreamer {
    /// Starts a streamer for `task_id`. Sequence numbers start at 1.
    pub fn new(store: TaskStore, task_id: TaskId, config: StreamerConfig) -> Self {
        let config = StreamerConfig {
            max_lines: config.max_lines.max(1),
            ..config
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(store, task_id.clone(), rx));
        Self {
            inner: Arc::new(Inner {
                task_id,
                config,
                state: Mutex::new(State {
                    buffer: Vec::with_capacity(config.max_lines),
                    next_seq: 1,
                    generation: 0,
                    error_lines: 0,
                    timer: None,
                    tx: Some(tx),
                    closed: false,
                }),
            }),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Task this streamer writes for.
    pub fn task_id(&self) -> &TaskId {
        &self.inner.task_id
    }

    /// Buffers one entry, flushing if a trigger fires.
    pub fn write(&self, entry: LogEntry) -> Result<(), LogStreamError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(LogStreamError::Closed);
        }
        if entry.is_error() {
            state.error_lines = state.error_lines.saturating_add(1);
        }
        state.buffer.push(entry);

        if state.buffer.len() >= self.inner.config.max_lines {
            self.inner.flush_locked(&mut state);
        } else if state.buffer.len() == 1 {
            let generation = state.generation;
            let inner = Arc::clone(&self.inner);
            let interval = self.inner.config.flush_interval;
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                let mut state = inner.state.lock();
                if state.generation == generation && !state.closed {
                    inner.flush_locked(&mut state);
                }
            }));
        }
        Ok(())
    }

    /// Buffers a stdout line.
    pub fn write_line(&self, line: impl Into<String>) -> Result<(), LogStreamError> {
        self.write(LogEntry::stdout(line))
    }

    /// Buffers a stderr line.
    pub fn write_error(&self, line: impl Into<String>) -> Result<(), LogStreamError> {
        self.write(LogEntry::stderr(line))
    }

    /// Flushes the buffer now, regardless of triggers.
    pub fn flush(&self) -> Result<(), LogStreamError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(LogStreamError::Closed);
        }
        self.inner.flush_locked(&mut state);
        Ok(())
    }

    /// Closes the stream and waits until every chunk has been written.
    ///
    /// # Errors
    ///
    /// - [`LogStreamError::Closed`] if called twice.
    /// - [`LogStreamError::ChunksLost`] if any chunk write failed; the
    ///   error still carries the summary of what was persisted.
    pub async fn end(&self) -> Result<StreamSummary, LogStreamError> {
        let (writer, error_lines) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(LogStreamError::Closed);
            }
            self.inner.flush_locked(&mut state);
            state.closed = true;
            state.tx = None;
            (self.writer.lock().take(), state.error_lines)
        };

        let report = match writer {
            Some(handle) => handle
                .await
                .map_err(|e| LogStreamError::WriterFailed(e.to_string()))?,
            None => return Err(LogStreamError::Closed),
        };

        let summary = StreamSummary {
            chunks_written: report.chunks_written,
            lines_written: report.lines_written,
            error_lines,
        };
        let lost_chunks = report.failures.len();
        let lost_lines = report.failures.iter().map(|(lines, _)| lines).sum();
        match report.failures.into_iter().next() {
            None => Ok(summary),
            Some((_, first)) => Err(LogStreamError::ChunksLost {
                lost_chunks,
                lost_lines,
                first,
                summary,
            }),
        }
    }
}

impl OutputSink for LogStreamer {
    fn on_line(&self, line: &str) {
        if let Err(e) = self.write_line(line) {
            tracing::debug!(task_id = %self.inner.task_id, error = %e, "stdout line dropped");
        }
    }

    fn on_error(&self, line: &str) {
        if let Err(e) = self.write_error(line) {
            tracing::debug!(task_id = %self.inner.task_id, error = %e, "stderr line dropped");
        }
    }
}

async fn run_writer(
    store: TaskStore,
    task_id: TaskId,
    mut rx: mpsc::UnboundedReceiver<WriteJob>,
) -> WriterReport {
    let mut report = WriterReport::default();
    while let Some(job) = rx.recv().await {
        let lines = job.entries.len();
        match store.write_chunk(&task_id, &job.chunk, &job.entries).await {
            Ok(_) => {
                report.chunks_written += 1;
                report.lines_written += lines;
            },
            Err(e) => {
                tracing::warn!(task_id = %task_id, seq = job.chunk.seq, lines, error = %e, "failed to write log chunk");
                report.failures.push((lines, e));
            },
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackend;

    fn setup(max_lines: usize, flush_ms: u64) -> (TaskStore, TaskId, LogStreamer) {
        let store = TaskStore::new(Arc::new(InMemoryBackend::new()));
        let id = TaskId::parse("stream").unwrap();
        let streamer = LogStreamer::new(
            store.clone(),
            id.clone(),
            StreamerConfig {
                max_lines,
                flush_interval: Duration::from_millis(flush_ms),
            },
        );
        (store, id, streamer)
    }

    #[tokio::test]
    async fn size_trigger_cuts_chunks() {
        let (store, id, streamer) = setup(3, 60_000);
        for i in 0..7 {
            streamer.write_line(format!("{i}")).unwrap();
        }
        let summary = streamer.end().await.unwrap();
        assert_eq!(summary.chunks_written, 3);
        let sizes: Vec<usize> = {
            let mut sizes = Vec::new();
            for chunk in store.list_log_chunks(&id).await.unwrap() {
                sizes.push(store.read_chunk(&id, &chunk).await.unwrap().len());
            }
            sizes
        };
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn time_trigger_flushes_a_trickle() {
        let (store, id, streamer) = setup(100, 2000);
        streamer.write_line("only").unwrap();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        // Let the writer task run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.list_log_chunks(&id).await.unwrap().len(), 1);
        streamer.end().await.unwrap();
    }

    #[tokio::test]
    async fn writes_after_end_are_rejected() {
        let (_, _, streamer) = setup(10, 1000);
        streamer.end().await.unwrap();
        assert!(matches!(streamer.write_line("late"), Err(LogStreamError::Closed)));
        assert!(matches!(streamer.end().await, Err(LogStreamError::Closed)));
    }

    #[tokio::test]
    async fn counts_error_lines() {
        let (_, _, streamer) = setup(10, 1000);
        streamer.on_line("ok");
        streamer.on_error("bad");
        streamer.on_error("worse");
        let summary = streamer.end().await.unwrap();
        assert_eq!(summary.error_lines, 2);
        assert_eq!(summary.lines_written, 3);
    }
}
