//! The opaque work a worker performs.
//!
//! A [`WorkExecutor`] receives the decrypted payload and reports output
//! through an [`OutputSink`]. What the work is (argument construction,
//! credential injection, the program itself) is up to the implementation.
//! [`CommandExecutor`] runs a program with the payload on stdin.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Exit code reported when execution was cancelled.
pub const EXIT_CANCELLED: i32 = 130;

/// Exit code reported when the program could not be started or awaited.
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// Receives output lines as they are produced.
pub trait OutputSink: Send + Sync {
    /// A regular output line.
    fn on_line(&self, line: &str);

    /// An error output line.
    fn on_error(&self, line: &str);
}

/// Result of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Process-style exit code; zero means success.
    pub exit_code: i32,
    /// Failure description, if any.
    pub error: Option<String>,
    /// Conversation turns used, when the work reports them.
    pub turns: Option<u32>,
}

impl ExecutionOutcome {
    /// A successful outcome.
    pub fn success() -> Self {
        Self::default()
    }

    /// A failed outcome.
    pub fn failure(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            exit_code,
            error: Some(error.into()),
            turns: None,
        }
    }

    /// Returns `true` when the exit code is zero and no error was recorded.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

/// Executes the work described by a decrypted payload.
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    /// Runs to completion, or until `cancel` fires.
    async fn execute(
        &self,
        payload: &Value,
        sink: &dyn OutputSink,
        cancel: CancellationToken,
    ) -> ExecutionOutcome;
}

/// Runs a program with the payload JSON on stdin.
///
/// Stdout lines go to [`OutputSink::on_line`], stderr lines to
/// [`OutputSink::on_error`]. Cancellation kills the child.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandExecutor {
    /// Runs `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Sets the argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable for the child.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl WorkExecutor for CommandExecutor {
    async fn execute(
        &self,
        payload: &Value,
        sink: &dyn OutputSink,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let input = match serde_json::to_vec(payload) {
            Ok(input) => input,
            Err(e) => return ExecutionOutcome::failure(EXIT_SPAWN_FAILED, e.to_string()),
        };

        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::failure(
                    EXIT_SPAWN_FAILED,
                    format!("failed to start {}: {e}", self.program.display()),
                )
            },
        };

        // Feed stdin concurrently so a chatty child cannot deadlock on a
        // full stdout pipe.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(error = %e, "child closed stdin early");
                }
            });
        }

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return ExecutionOutcome::failure(EXIT_SPAWN_FAILED, "child output pipes unavailable");
        };
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                line = stdout.next_line(), if !out_done => match line {
                    Ok(Some(line)) => sink.on_line(&line),
                    Ok(None) => out_done = true,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read child stdout");
                        out_done = true;
                    },
                },
                line = stderr.next_line(), if !err_done => match line {
                    Ok(Some(line)) => sink.on_error(&line),
                    Ok(None) => err_done = true,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read child stderr");
                        err_done = true;
                    },
                },
                () = cancel.cancelled() => break,
            }
        }

        let status = tokio::select! {
            status = child.wait(), if !cancel.is_cancelled() => Some(status),
            () = cancel.cancelled() => None,
        };
        match status {
            Some(Ok(status)) if status.success() => ExecutionOutcome::success(),
            Some(Ok(status)) => ExecutionOutcome::failure(
                status.code().unwrap_or(-1),
                format!("process exited with {status}"),
            ),
            Some(Err(e)) => ExecutionOutcome::failure(EXIT_SPAWN_FAILED, e.to_string()),
            None => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill cancelled child");
                }
                ExecutionOutcome::failure(EXIT_CANCELLED, "execution cancelled")
            },
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Collect {
        out: Mutex<Vec<String>>,
        err: Mutex<Vec<String>>,
    }

    impl OutputSink for Collect {
        fn on_line(&self, line: &str) {
            self.out.lock().push(line.to_string());
        }
        fn on_error(&self, line: &str) {
            self.err.lock().push(line.to_string());
        }
    }

    fn sh(script: &str) -> CommandExecutor {
        CommandExecutor::new("/bin/sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn payload_on_stdin_and_streams_split() {
        let sink = Collect::default();
        let outcome = sh("cat; echo; echo oops >&2")
            .execute(&json!({"prompt": "hi"}), &sink, CancellationToken::new())
            .await;
        assert!(outcome.succeeded());
        assert_eq!(sink.out.lock().as_slice(), [r#"{"prompt":"hi"}"#]);
        assert_eq!(sink.err.lock().as_slice(), ["oops"]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let sink = Collect::default();
        let outcome = sh("exit 3")
            .execute(&json!({}), &sink, CancellationToken::new())
            .await;
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let sink = Collect::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let outcome = sh("sleep 30").execute(&json!({}), &sink, cancel).await;
        assert_eq!(outcome.exit_code, EXIT_CANCELLED);
    }

    #[tokio::test]
    async fn missing_program() {
        let sink = Collect::default();
        let outcome = CommandExecutor::new("/nonexistent/bin")
            .execute(&json!({}), &sink, CancellationToken::new())
            .await;
        assert_eq!(outcome.exit_code, EXIT_SPAWN_FAILED);
    }
}
