//! Runtime configuration.
//!
//! [`HandoffConfig`] collects the tunables of both sides of the handoff.
//! Build it in code with the `with_*` methods, or read it from `HANDOFF_*`
//! environment variables with [`HandoffConfig::from_env`]:
//!
//! ```bash
//! export HANDOFF_CHUNK_MAX_LINES=200
//! export HANDOFF_WATCH_TIMEOUT_MS=600000
//! export HANDOFF_WEBHOOK_SECRET="whsec_..."
//! ```

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

use crate::logs::{StreamerConfig, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_LINES};
use crate::watcher::WatchOptions;
use crate::webhook::{DEFAULT_TOLERANCE_SECS, DEFAULT_WEBHOOK_TIMEOUT};

/// Lines per log chunk.
pub const ENV_CHUNK_MAX_LINES: &str = "HANDOFF_CHUNK_MAX_LINES";
/// Log flush interval in milliseconds.
pub const ENV_FLUSH_INTERVAL_MS: &str = "HANDOFF_FLUSH_INTERVAL_MS";
/// Completion watch timeout in milliseconds.
pub const ENV_WATCH_TIMEOUT_MS: &str = "HANDOFF_WATCH_TIMEOUT_MS";
/// Completion poll interval in milliseconds.
pub const ENV_POLL_INTERVAL_MS: &str = "HANDOFF_POLL_INTERVAL_MS";
/// Ticks before a finished job without terminal status counts as lost.
pub const ENV_LOST_JOB_GRACE_TICKS: &str = "HANDOFF_LOST_JOB_GRACE_TICKS";
/// Webhook request timeout in milliseconds.
pub const ENV_WEBHOOK_TIMEOUT_MS: &str = "HANDOFF_WEBHOOK_TIMEOUT_MS";
/// Accepted webhook timestamp skew in seconds.
pub const ENV_SIGNATURE_TOLERANCE_SECS: &str = "HANDOFF_SIGNATURE_TOLERANCE_SECS";
/// Job definition name on the execution platform.
pub const ENV_JOB_NAME: &str = "HANDOFF_JOB_NAME";
/// Shared webhook signing secret.
pub const ENV_WEBHOOK_SECRET: &str = "HANDOFF_WEBHOOK_SECRET";

/// Default job definition name.
pub const DEFAULT_JOB_NAME: &str = "handoff-worker";

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is set but cannot be used.
    #[error("invalid value {value:?} for {key}")]
    Invalid {
        /// Variable name.
        key: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Tunables for submitter and worker.
#[derive(Clone)]
pub struct HandoffConfig {
    /// Lines per log chunk.
    pub chunk_max_lines: usize,
    /// Maximum age of buffered log lines.
    pub flush_interval: Duration,
    /// How long a synchronous caller waits for a terminal status.
    pub watch_timeout: Duration,
    /// Pause between completion polls.
    pub poll_interval: Duration,
    /// See [`WatchOptions::lost_job_grace_ticks`].
    pub lost_job_grace_ticks: u32,
    /// Webhook request timeout.
    pub webhook_timeout: Duration,
    /// Accepted webhook timestamp skew.
    pub signature_tolerance: Duration,
    /// Job definition name on the execution platform.
    pub job_name: String,
    /// Webhook signing secret. Async tasks get no webhook without it.
    pub webhook_secret: Option<SecretString>,
}

impl std::fmt::Debug for HandoffConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffConfig")
            .field("chunk_max_lines", &self.chunk_max_lines)
            .field("flush_interval", &self.flush_interval)
            .field("watch_timeout", &self.watch_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("lost_job_grace_ticks", &self.lost_job_grace_ticks)
            .field("webhook_timeout", &self.webhook_timeout)
            .field("signature_tolerance", &self.signature_tolerance)
            .field("job_name", &self.job_name)
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        let watch = WatchOptions::default();
        Self {
            chunk_max_lines: DEFAULT_MAX_LINES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            watch_timeout: watch.timeout,
            poll_interval: watch.poll_interval,
            lost_job_grace_ticks: watch.lost_job_grace_ticks,
            webhook_timeout: DEFAULT_WEBHOOK_TIMEOUT,
            signature_tolerance: Duration::from_secs(DEFAULT_TOLERANCE_SECS),
            job_name: DEFAULT_JOB_NAME.to_string(),
            webhook_secret: None,
        }
    }
}

impl HandoffConfig {
    /// Defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `HANDOFF_*` environment variables over the defaults.
    ///
    /// Unset and empty variables keep their default.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] when a variable does not parse or is zero
    /// where zero makes no sense.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get(ENV_CHUNK_MAX_LINES) {
            config.chunk_max_lines = parse_positive(ENV_CHUNK_MAX_LINES, &v)?;
        }
        if let Some(v) = get(ENV_FLUSH_INTERVAL_MS) {
            config.flush_interval = parse_millis(ENV_FLUSH_INTERVAL_MS, &v)?;
        }
        if let Some(v) = get(ENV_WATCH_TIMEOUT_MS) {
            config.watch_timeout = parse_millis(ENV_WATCH_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = get(ENV_POLL_INTERVAL_MS) {
            config.poll_interval = parse_millis(ENV_POLL_INTERVAL_MS, &v)?;
        }
        if let Some(v) = get(ENV_LOST_JOB_GRACE_TICKS) {
            config.lost_job_grace_ticks = parse(ENV_LOST_JOB_GRACE_TICKS, &v)?;
        }
        if let Some(v) = get(ENV_WEBHOOK_TIMEOUT_MS) {
            config.webhook_timeout = parse_millis(ENV_WEBHOOK_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = get(ENV_SIGNATURE_TOLERANCE_SECS) {
            config.signature_tolerance =
                Duration::from_secs(parse(ENV_SIGNATURE_TOLERANCE_SECS, &v)?);
        }
        if let Some(v) = get(ENV_JOB_NAME) {
            config.job_name = v.trim().to_string();
        }
        if let Some(v) = get(ENV_WEBHOOK_SECRET) {
            config.webhook_secret = Some(SecretString::from(v));
        }

        Ok(config)
    }

    /// Sets the lines per log chunk.
    pub fn with_chunk_max_lines(mut self, lines: usize) -> Self {
        self.chunk_max_lines = lines;
        self
    }

    /// Sets the log flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the completion watch timeout.
    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    /// Sets the completion poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the lost-job grace ticks. Zero disables lost-job detection.
    pub fn with_lost_job_grace_ticks(mut self, ticks: u32) -> Self {
        self.lost_job_grace_ticks = ticks;
        self
    }

    /// Sets the webhook request timeout.
    pub fn with_webhook_timeout(mut self, timeout: Duration) -> Self {
        self.webhook_timeout = timeout;
        self
    }

    /// Sets the accepted webhook timestamp skew.
    pub fn with_signature_tolerance(mut self, tolerance: Duration) -> Self {
        self.signature_tolerance = tolerance;
        self
    }

    /// Sets the job definition name.
    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = name.into();
        self
    }

    /// Sets the webhook signing secret.
    pub fn with_webhook_secret(mut self, secret: SecretString) -> Self {
        self.webhook_secret = Some(secret);
        self
    }

    /// Log chunking triggers for the worker.
    pub fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig {
            max_lines: self.chunk_max_lines,
            flush_interval: self.flush_interval,
        }
    }

    /// Polling parameters for the submitter.
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            timeout: self.watch_timeout,
            poll_interval: self.poll_interval,
            lost_job_grace_ticks: self.lost_job_grace_ticks,
        }
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn parse_positive(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match parse::<usize>(key, value)? {
        0 => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
        n => Ok(n),
    }
}

fn parse_millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match parse::<u64>(key, value)? {
        0 => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
        ms => Ok(Duration::from_millis(ms)),
    }
}
