//! Encrypted task handoff between a submitting process and isolated job
//! workers.
//!
//! A submitter accepts a unit of work, envelope-encrypts its payload,
//! stores it next to a `pending` status document, and starts a job that
//! receives nothing but the task identifier and a pointer to the encrypted
//! payload. The worker decrypts, executes, streams its output into
//! immutable log chunks, and records a terminal status. The submitter
//! learns the outcome by polling the store (synchronous callers) or
//! through a signed webhook the worker sends once (asynchronous callers).
//!
//! # Module Organization
//!
//! - [`types`] - Task identifiers, the status document and its state machine
//! - [`crypto`] - Envelope encryption over a key-management service
//! - [`store`] - Object backends and the task-aware [`TaskStore`]
//! - [`logs`] - Chunked log streaming
//! - [`dispatch`] - Job platforms and the [`JobDispatcher`]
//! - [`registry`] - Per-process task bookkeeping for cancellation
//! - [`watcher`] - Completion detection by polling
//! - [`webhook`] - HMAC-signed completion webhooks
//! - [`executor`] - The opaque work a worker runs
//! - [`worker`] - Job-side pipeline
//! - [`submitter`] - Submit-side pipeline and cancellation
//! - [`config`] - `HANDOFF_*` configuration
//! - [`error`] - Top-level error taxonomy
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use task_handoff::crypto::{EnvelopeCodec, LocalKms};
//! use task_handoff::dispatch::{JobCommand, JobDispatcher, ProcessPlatform};
//! use task_handoff::store::{FsBackend, TaskStore};
//! use task_handoff::submitter::{SubmitRequest, Submitter};
//!
//! # async fn run() -> Result<(), task_handoff::error::HandoffError> {
//! let store = TaskStore::new(Arc::new(FsBackend::new("/var/lib/handoff")));
//! let codec = EnvelopeCodec::new(Arc::new(LocalKms::generate()));
//! let platform = ProcessPlatform::new()
//!     .with_job("handoff-worker", JobCommand::new("/usr/local/bin/handoff-worker"));
//! let dispatcher = JobDispatcher::new(Arc::new(platform), "handoff-worker");
//!
//! let submitter = Submitter::new(store, codec, dispatcher);
//! let accepted = submitter
//!     .submit(SubmitRequest::asynchronous(
//!         json!({"prompt": "summarize the report"}),
//!         "https://hooks.example.com/done",
//!     ))
//!     .await?;
//! println!("{} is {}", accepted.task_id, accepted.status);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod logs;
pub mod registry;
pub mod store;
pub mod submitter;
pub mod types;
pub mod watcher;
pub mod webhook;
pub mod worker;

pub use config::HandoffConfig;
pub use crypto::EnvelopeCodec;
pub use dispatch::JobDispatcher;
pub use error::{HandoffError, ValidationError};
pub use logs::LogStreamer;
pub use registry::TaskRegistry;
pub use store::TaskStore;
pub use submitter::{SubmitRequest, Submitter};
pub use types::{TaskId, TaskKind, TaskMetadata, TaskStatus};
pub use watcher::CompletionWatcher;
pub use webhook::WebhookNotifier;
pub use worker::Worker;
