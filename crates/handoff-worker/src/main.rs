//! handoff-worker: runs one handed-off task.
//!
//! A job platform launches this binary with `TASK_ID` and
//! `PAYLOAD_POINTER` set. It reads the task's status document, decrypts
//! the payload, runs the configured command with the payload on stdin,
//! streams the command's output into the store, records the terminal
//! status, sends the webhook for async tasks and exits with the task's
//! exit code.
//!
//! ```bash
//! TASK_ID=4f1c... PAYLOAD_POINTER=tasks/4f1c.../payload.enc \
//! HANDOFF_STORE_DIR=/var/lib/handoff HANDOFF_MASTER_KEY=$(cat master.hex) \
//! handoff-worker -- /usr/local/bin/agent --json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use task_handoff::crypto::{EnvelopeCodec, KeyManagementService, LocalKms};
use task_handoff::dispatch::{JobRequest, PAYLOAD_POINTER_PARAM, TASK_ID_PARAM};
use task_handoff::executor::CommandExecutor;
use task_handoff::store::{FsBackend, ObjectBackend, TaskStore};
use task_handoff::{HandoffConfig, WebhookNotifier, Worker};
use tokio_util::sync::CancellationToken;

/// Run one handed-off task
#[derive(Parser)]
#[command(name = "handoff-worker")]
#[command(about = "Run one handed-off task and exit with its exit code", long_about = None)]
#[command(version)]
struct Cli {
    /// Task to run
    #[arg(long, env = TASK_ID_PARAM)]
    task_id: String,

    /// Store key of the encrypted payload
    #[arg(long, env = PAYLOAD_POINTER_PARAM)]
    payload_pointer: String,

    /// Root directory of the filesystem task store
    #[arg(long, env = "HANDOFF_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// S3 bucket holding the task store
    #[cfg(feature = "aws")]
    #[arg(long, env = "HANDOFF_S3_BUCKET", conflicts_with = "store_dir")]
    s3_bucket: Option<String>,

    /// Hex-encoded 32-byte master key for local envelope decryption
    #[arg(long, env = "HANDOFF_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    /// AWS KMS key used to unwrap payload keys
    #[cfg(feature = "aws")]
    #[arg(long, env = "HANDOFF_KMS_KEY_ID", conflicts_with = "master_key")]
    kms_key_id: Option<String>,

    /// Program that performs the work, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, num_args = 1..)]
    command: Vec<String>,
}

impl Cli {
    async fn backend(&self) -> Result<Arc<dyn ObjectBackend>> {
        #[cfg(feature = "aws")]
        if let Some(bucket) = &self.s3_bucket {
            return Ok(Arc::new(
                task_handoff::store::S3Backend::from_env(bucket.clone()).await,
            ));
        }
        match &self.store_dir {
            Some(dir) => Ok(Arc::new(FsBackend::new(dir))),
            None => bail!("no task store configured (set HANDOFF_STORE_DIR)"),
        }
    }

    async fn kms(&self) -> Result<Arc<dyn KeyManagementService>> {
        #[cfg(feature = "aws")]
        if let Some(key_id) = &self.kms_key_id {
            return Ok(Arc::new(
                task_handoff::crypto::AwsKms::from_env(key_id.clone()).await,
            ));
        }
        match &self.master_key {
            Some(hex_key) => Ok(Arc::new(
                LocalKms::from_hex(hex_key).context("invalid HANDOFF_MASTER_KEY")?,
            )),
            None => bail!("no key management configured (set HANDOFF_MASTER_KEY)"),
        }
    }

    fn request(&self) -> Result<JobRequest> {
        JobRequest::from_parameters(|name| match name {
            TASK_ID_PARAM => Some(self.task_id.clone()),
            PAYLOAD_POINTER_PARAM => Some(self.payload_pointer.clone()),
            _ => None,
        })
        .context("invalid job parameters")
    }

    fn executor(&self) -> Result<CommandExecutor> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("no command given");
        };
        Ok(CommandExecutor::new(program).with_args(args.iter().cloned()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = run(cli).await?;
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = HandoffConfig::from_env().context("invalid HANDOFF_* configuration")?;
    let request = cli.request()?;

    let store = TaskStore::new(cli.backend().await?);
    let codec = EnvelopeCodec::new(cli.kms().await?);
    let mut worker = Worker::new(store, codec, Arc::new(cli.executor()?))
        .with_streamer_config(config.streamer_config());
    match config.webhook_secret.clone() {
        Some(secret) => {
            worker = worker
                .with_notifier(WebhookNotifier::new(secret).with_timeout(config.webhook_timeout));
        },
        None => tracing::debug!("HANDOFF_WEBHOOK_SECRET not set, async tasks get no webhook"),
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let outcome = worker
        .run(&request, cancel)
        .await
        .with_context(|| format!("task {} aborted", request.task_id))?;
    Ok(outcome.process_exit_code())
}

/// Cancels the task on Ctrl-C, or on SIGTERM from the job platform.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            },
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("termination requested, cancelling task");
    cancel.cancel();
}
