//! Child-process job platform.
//!
//! [`ProcessPlatform`] launches each job definition as a local program,
//! typically the `handoff-worker` binary. Job parameters become environment
//! variables of the child, exactly as a container platform would inject
//! them. Cancelling a job sends the child `SIGTERM` and, if it is still
//! alive after the termination grace period, `SIGKILL`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::process::{Child, Command};

use super::platform::{
    JobHandle, JobPlatform, JobRequest, JobState, JobTable, PlatformError, PlatformErrorKind,
};

/// Program and static environment of one job definition.
#[derive(Debug, Clone)]
pub struct JobCommand {
    /// Executable to launch.
    pub program: PathBuf,
    /// Fixed arguments.
    pub args: Vec<String>,
    /// Extra environment (store location, key material references, ...).
    pub env: Vec<(String, String)>,
}

impl JobCommand {
    /// A definition running `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Job platform that runs each job as a child process.
///
/// ```
/// use task_handoff::dispatch::{JobCommand, ProcessPlatform};
///
/// let platform = ProcessPlatform::new().with_job(
///     "handoff-worker",
///     JobCommand::new("/usr/local/bin/handoff-worker").env("HANDOFF_STORE_DIR", "/srv/handoff"),
/// );
/// # let _ = platform;
/// ```
#[derive(Debug)]
pub struct ProcessPlatform {
    definitions: RwLock<HashMap<String, JobCommand>>,
    jobs: JobTable,
    termination_grace: Duration,
}

/// How long a cancelled child may take to exit after `SIGTERM`.
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(10);

impl Default for ProcessPlatform {
    fn default() -> Self {
        Self {
            definitions: RwLock::default(),
            jobs: JobTable::default(),
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }
}

impl ProcessPlatform {
    /// Creates a platform with no job definitions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long a cancelled child gets between `SIGTERM` and `SIGKILL`.
    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    /// Keeps finished jobs queryable for `retention` instead of
    /// [`DEFAULT_JOB_RETENTION`](super::DEFAULT_JOB_RETENTION).
    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.jobs = JobTable::with_retention(retention);
        self
    }

    /// Number of jobs currently tracked, running or within retention.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Adds a job definition.
    pub fn with_job(self, job_name: impl Into<String>, command: JobCommand) -> Self {
        self.definitions.write().insert(job_name.into(), command);
        self
    }

    /// Waits until the job's process exits.
    pub async fn wait(&self, handle: &JobHandle) -> Option<JobState> {
        self.jobs.wait(handle).await
    }
}

fn spawn_error(job_name: &str, err: std::io::Error) -> PlatformError {
    let kind = match err.kind() {
        ErrorKind::NotFound => PlatformErrorKind::DefinitionNotFound,
        ErrorKind::PermissionDenied => PlatformErrorKind::PermissionDenied,
        _ => PlatformErrorKind::Other,
    };
    PlatformError::new(kind, format!("failed to start job {job_name}: {err}")).with_source(err)
}

/// Asks the child to stop, then kills it once `grace` runs out.
async fn terminate(child: &mut Child, grace: Duration, job: &JobHandle) {
    if stop_gracefully(child, grace, job).await {
        return;
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(job = %job, error = %e, "failed to kill job process");
    }
}

/// Sends `SIGTERM` and waits up to `grace`. Returns `true` once the child exited.
#[cfg(unix)]
async fn stop_gracefully(child: &mut Child, grace: Duration, job: &JobHandle) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(job = %job, pid, error = %e, "failed to signal job process");
        return false;
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(job = %job, pid, status = %status, "job process stopped after SIGTERM");
            true
        },
        Ok(Err(e)) => {
            tracing::warn!(job = %job, pid, error = %e, "failed to wait for job process");
            false
        },
        Err(_) => {
            tracing::warn!(job = %job, pid, grace_ms = grace.as_millis() as u64, "job process ignored SIGTERM");
            false
        },
    }
}

#[cfg(not(unix))]
async fn stop_gracefully(_child: &mut Child, _grace: Duration, _job: &JobHandle) -> bool {
    false
}

#[async_trait]
impl JobPlatform for ProcessPlatform {
    async fn run_job(
        &self,
        job_name: &str,
        request: &JobRequest,
    ) -> Result<JobHandle, PlatformError> {
        let definition = self.definitions.read().get(job_name).cloned().ok_or_else(|| {
            PlatformError::new(
                PlatformErrorKind::DefinitionNotFound,
                format!("no job definition named {job_name}"),
            )
        })?;

        let mut command = Command::new(&definition.program);
        command
            .args(&definition.args)
            .envs(definition.env.iter().cloned())
            .envs(request.parameters())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|e| spawn_error(job_name, e))?;

        let slot = self.jobs.insert(job_name);
        slot.running();
        let handle = slot.handle.clone();
        let grace = self.termination_grace;
        tracing::debug!(job = %handle, pid = ?child.id(), "job process started");

        tokio::spawn(async move {
            let job = &slot.handle;
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                () = slot.cancel.cancelled() => None,
            };
            let final_state = match exited {
                Some(Ok(status)) if status.success() => JobState::Succeeded,
                Some(Ok(status)) => {
                    tracing::debug!(job = %job, status = %status, "job process exited");
                    JobState::Failed
                },
                Some(Err(e)) => {
                    tracing::warn!(job = %job, error = %e, "failed to wait for job process");
                    JobState::Failed
                },
                None => {
                    terminate(&mut child, grace, job).await;
                    JobState::Cancelled
                },
            };
            slot.finish(final_state);
        });

        Ok(handle)
    }

    async fn cancel_job(&self, handle: &JobHandle) -> Result<(), PlatformError> {
        self.jobs.cancel(handle)
    }

    async fn job_state(&self, handle: &JobHandle) -> Result<Option<JobState>, PlatformError> {
        Ok(self.jobs.state(handle))
    }
}
