//! One-shot signed webhook delivery.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};

use super::signature::{
    canonical_json, sign_canonical, SIGNATURE_HEADER, SIGNATURE_PREFIX, TIMESTAMP_HEADER,
};
use crate::types::TerminalResult;

/// Default request timeout for deliveries.
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// What happened to a delivery. Never retried, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The receiver answered 2xx.
    Delivered {
        /// Response status.
        status: u16,
    },
    /// The receiver answered with a non-2xx status.
    Rejected {
        /// Response status.
        status: u16,
    },
    /// The request could not be built or sent.
    Failed {
        /// Description of the failure.
        reason: String,
    },
}

impl DeliveryOutcome {
    /// Returns `true` for [`Delivered`](Self::Delivered).
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Posts signed terminal results to callback URLs.
///
/// ```
/// use secrecy::SecretString;
/// use task_handoff::webhook::WebhookNotifier;
///
/// let notifier = WebhookNotifier::new(SecretString::from("whsec_example"));
/// # let _ = notifier;
/// ```
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    secret: SecretString,
    timeout: Duration,
}

impl std::fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookNotifier")
            .field("secret", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl WebhookNotifier {
    /// Creates a notifier signing with `secret`.
    pub fn new(secret: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret,
            timeout: DEFAULT_WEBHOOK_TIMEOUT,
        }
    }

    /// Uses a pre-configured HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delivers `result` to `url` with a single POST.
    ///
    /// The body is the canonical JSON that was signed. Failures are logged
    /// and returned as an outcome; the task's status is never affected.
    pub async fn notify(&self, url: &str, result: &TerminalResult) -> DeliveryOutcome {
        let outcome = self.deliver(url, result).await;
        match &outcome {
            DeliveryOutcome::Delivered { status } => {
                tracing::info!(task_id = %result.task_id, status, "webhook delivered");
            },
            DeliveryOutcome::Rejected { status } => {
                tracing::warn!(task_id = %result.task_id, status, "webhook rejected by receiver");
            },
            DeliveryOutcome::Failed { reason } => {
                tracing::warn!(task_id = %result.task_id, reason = %reason, "webhook delivery failed");
            },
        }
        outcome
    }

    async fn deliver(&self, url: &str, result: &TerminalResult) -> DeliveryOutcome {
        let failed = |reason: String| DeliveryOutcome::Failed { reason };

        let target = match url::Url::parse(url) {
            Ok(target) if matches!(target.scheme(), "http" | "https") => target,
            Ok(target) => return failed(format!("unsupported callback scheme {}", target.scheme())),
            Err(e) => return failed(format!("invalid callback URL: {e}")),
        };
        let body = match serde_json::to_value(result)
            .map_err(|e| e.to_string())
            .and_then(|value| canonical_json(&value).map_err(|e| e.to_string()))
        {
            Ok(body) => body,
            Err(reason) => return failed(reason),
        };
        let timestamp = Utc::now().timestamp();
        let signature =
            match sign_canonical(self.secret.expose_secret().as_bytes(), timestamp, &body) {
                Ok(signature) => signature,
                Err(e) => return failed(e.to_string()),
            };

        let response = self
            .client
            .post(target)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, format!("{SIGNATURE_PREFIX}{signature}"))
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => DeliveryOutcome::Delivered {
                status: response.status().as_u16(),
            },
            Ok(response) => DeliveryOutcome::Rejected {
                status: response.status().as_u16(),
            },
            Err(e) => failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskId, TaskStatus, TaskSummary};

    fn result() -> TerminalResult {
        TerminalResult {
            task_id: TaskId::parse("n1").unwrap(),
            status: TaskStatus::Completed,
            exit_code: Some(0),
            logs_path: "mem://sessions/n1/".into(),
            summary: TaskSummary::default(),
            error: None,
            metadata: None,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn invalid_urls_fail_without_sending() {
        let notifier = WebhookNotifier::new(SecretString::from("s"));
        assert!(matches!(
            notifier.notify("not a url", &result()).await,
            DeliveryOutcome::Failed { .. }
        ));
        assert!(matches!(
            notifier.notify("ftp://example.com/hook", &result()).await,
            DeliveryOutcome::Failed { .. }
        ));
    }

    #[test]
    fn debug_hides_secret() {
        let notifier = WebhookNotifier::new(SecretString::from("whsec_do_not_print"));
        assert!(!format!("{notifier:?}").contains("do_not_print"));
    }
}
