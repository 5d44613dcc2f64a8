//! Signed completion webhooks.
//!
//! - [`signature`] - HMAC-SHA256 over the timestamp and canonical body,
//!   plus the receiver-side [`verify`].
//! - [`notifier`] - [`WebhookNotifier`], a single unretried POST.

pub mod notifier;
pub mod signature;

pub use notifier::{DeliveryOutcome, WebhookNotifier, DEFAULT_WEBHOOK_TIMEOUT};
pub use signature::{
    canonical_json, sign, sign_canonical, verify, verify_parts, SignatureError,
    DEFAULT_TOLERANCE_SECS, SIGNATURE_HEADER, SIGNATURE_PREFIX, TIMESTAMP_HEADER,
};
