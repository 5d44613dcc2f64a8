//! Log line format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Output stream a line was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    /// Regular output.
    Stdout,
    /// Error output.
    Stderr,
}

/// One captured output line, stored as one JSON object per chunk line.
///
/// ```
/// use task_handoff::logs::{LogEntry, LogStream};
///
/// let entry = LogEntry::stderr("boom");
/// assert_eq!(entry.stream, LogStream::Stderr);
/// let json = serde_json::to_value(&entry).unwrap();
/// assert_eq!(json["stream"], "stderr");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Source stream.
    pub stream: LogStream,
    /// Line content without the trailing newline.
    pub line: String,
}

impl LogEntry {
    /// A stdout line captured now.
    pub fn stdout(line: impl Into<String>) -> Self {
        Self::new(LogStream::Stdout, line)
    }

    /// A stderr line captured now.
    pub fn stderr(line: impl Into<String>) -> Self {
        Self::new(LogStream::Stderr, line)
    }

    /// A line on `stream` captured now.
    pub fn new(stream: LogStream, line: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            line: line.into(),
        }
    }

    /// Returns `true` for stderr lines.
    pub fn is_error(&self) -> bool {
        self.stream == LogStream::Stderr
    }
}
