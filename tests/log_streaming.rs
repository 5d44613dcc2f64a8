//! Integration tests for chunked log streaming.
//!
//! Runs the streamer against the filesystem backend so chunk files, names
//! and ordering are observed the way a reader in another process would.

use std::sync::Arc;
use std::time::Duration;

use task_handoff::logs::{LogEntry, LogStream, LogStreamError, LogStreamer, StreamerConfig};
use task_handoff::store::{FsBackend, TaskStore};
use task_handoff::types::TaskId;
use tempfile::TempDir;

fn fs_store() -> (TempDir, TaskStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::new(Arc::new(FsBackend::new(dir.path())));
    (dir, store)
}

fn config(max_lines: usize) -> StreamerConfig {
    StreamerConfig {
        max_lines,
        flush_interval: Duration::from_secs(60),
    }
}

async fn read_all(store: &TaskStore, id: &TaskId) -> Vec<Vec<LogEntry>> {
    let mut chunks = Vec::new();
    for name in store.list_log_chunks(id).await.unwrap() {
        chunks.push(store.read_chunk(id, &name).await.unwrap());
    }
    chunks
}

// ─── Chunk Ordering ─────────────────────────────────────────────────────────

mod ordering {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn two_hundred_fifty_lines_make_three_chunks() {
        let (_dir, store) = fs_store();
        let id = TaskId::parse("order-250").unwrap();
        let streamer = LogStreamer::new(store.clone(), id.clone(), config(100));

        for i in 0..250 {
            streamer.write_line(format!("line {i}")).unwrap();
        }
        let summary = streamer.end().await.unwrap();
        assert_eq!(summary.chunks_written, 3);
        assert_eq!(summary.lines_written, 250);

        let names = store.list_log_chunks(&id).await.unwrap();
        let seqs: Vec<u32> = names.iter().map(|n| n.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(names[0].to_string().starts_with("001-"));

        let chunks = read_all(&store, &id).await;
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);

        let lines: Vec<String> = chunks.into_iter().flatten().map(|e| e.line).collect();
        let expected: Vec<String> = (0..250).map(|i| format!("line {i}")).collect();
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn interleaved_streams_keep_write_order() {
        let (_dir, store) = fs_store();
        let id = TaskId::parse("mixed").unwrap();
        let streamer = LogStreamer::new(store.clone(), id.clone(), config(4));

        for i in 0..10 {
            if i % 3 == 0 {
                streamer.write_error(format!("e{i}")).unwrap();
            } else {
                streamer.write_line(format!("o{i}")).unwrap();
            }
        }
        let summary = streamer.end().await.unwrap();
        assert_eq!(summary.error_lines, 4);

        let entries: Vec<LogEntry> = read_all(&store, &id).await.into_iter().flatten().collect();
        let rendered: Vec<(LogStream, String)> =
            entries.into_iter().map(|e| (e.stream, e.line)).collect();
        assert_eq!(rendered[0], (LogStream::Stderr, "e0".to_string()));
        assert_eq!(rendered[1], (LogStream::Stdout, "o1".to_string()));
        assert_eq!(rendered[9], (LogStream::Stderr, "e9".to_string()));
    }
}

// ─── Flush On Close ─────────────────────────────────────────────────────────

mod flush_on_close {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn lines_below_size_trigger_survive_end() {
        let (_dir, store) = fs_store();
        let id = TaskId::parse("short").unwrap();
        let streamer = LogStreamer::new(store.clone(), id.clone(), config(100));

        for i in 0..37 {
            streamer.write_line(format!("{i}")).unwrap();
        }
        assert!(store.list_log_chunks(&id).await.unwrap().is_empty());

        let summary = streamer.end().await.unwrap();
        assert_eq!(summary.lines_written, 37);

        let chunks = read_all(&store, &id).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 37);
    }

    #[tokio::test]
    async fn end_without_output_writes_nothing() {
        let (_dir, store) = fs_store();
        let id = TaskId::parse("silent").unwrap();
        let streamer = LogStreamer::new(store.clone(), id.clone(), config(100));
        let summary = streamer.end().await.unwrap();
        assert_eq!(summary.chunks_written, 0);
        assert!(store.list_log_chunks(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_streamer_rejects_lines() {
        let (_dir, store) = fs_store();
        let streamer = LogStreamer::new(store, TaskId::parse("closed").unwrap(), config(10));
        streamer.write_line("before").unwrap();
        streamer.end().await.unwrap();
        assert!(matches!(
            streamer.write_line("after"),
            Err(LogStreamError::Closed)
        ));
    }
}
