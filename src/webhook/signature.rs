//! Webhook signing and verification.
//!
//! ```text
//! X-Webhook-Timestamp: {unixSeconds}
//! X-Webhook-Signature: sha256={hex(HMAC-SHA256(secret, "{unixSeconds}." + JCS(body)))}
//! ```
//!
//! The body is canonicalized with RFC 8785 (JCS) before signing, and the
//! notifier sends exactly those canonical bytes.

use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Header carrying the signing time in Unix seconds.
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// Scheme prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Default maximum age of a signed request, in seconds.
pub const DEFAULT_TOLERANCE_SECS: u64 = 300;

/// Signing or verification failures.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// A required header is absent.
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    /// A header is present but unusable.
    #[error("malformed header {header}: {reason}")]
    MalformedHeader {
        /// Header name.
        header: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The timestamp is older than the tolerance.
    #[error("signature timestamp is {age_secs}s old")]
    Expired {
        /// Age of the timestamp.
        age_secs: u64,
    },

    /// The timestamp is further in the future than the tolerance.
    #[error("signature timestamp is {skew_secs}s in the future")]
    FromFuture {
        /// How far ahead the timestamp is.
        skew_secs: u64,
    },

    /// The signature does not match the body.
    #[error("signature mismatch")]
    Mismatch,

    /// The body is not JSON.
    #[error("webhook body is not valid JSON: {0}")]
    InvalidBody(#[from] serde_json::Error),

    /// The secret cannot key an HMAC.
    #[error("invalid webhook secret: {0}")]
    InvalidSecret(String),

    /// The body could not be canonicalized.
    #[error("failed to canonicalize webhook body: {0}")]
    Canonicalization(String),
}

/// Returns the RFC 8785 canonical form of `payload`.
pub fn canonical_json(payload: &Value) -> Result<Vec<u8>, SignatureError> {
    serde_json_canonicalizer::to_vec(payload)
        .map_err(|e| SignatureError::Canonicalization(e.to_string()))
}

fn mac_over(secret: &[u8], timestamp: i64, canonical: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| SignatureError::InvalidSecret(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(canonical);
    Ok(mac)
}

/// Signs already-canonical bytes. Returns the lowercase hex digest.
pub fn sign_canonical(
    secret: &[u8],
    timestamp: i64,
    canonical: &[u8],
) -> Result<String, SignatureError> {
    let mac = mac_over(secret, timestamp, canonical)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Signs `payload` at `timestamp`. Returns the lowercase hex digest.
///
/// ```
/// use serde_json::json;
/// use task_handoff::webhook::sign;
///
/// let a = sign(b"secret", 1_700_000_000, &json!({"b": 1, "a": 2})).unwrap();
/// let b = sign(b"secret", 1_700_000_000, &json!({"a": 2, "b": 1})).unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
pub fn sign(secret: &[u8], timestamp: i64, payload: &Value) -> Result<String, SignatureError> {
    sign_canonical(secret, timestamp, &canonical_json(payload)?)
}

/// Verifies a delivery from its raw header values.
///
/// The body is re-canonicalized before the HMAC is recomputed, and the
/// comparison is constant-time.
pub fn verify_parts(
    secret: &[u8],
    signature: &str,
    timestamp: &str,
    body: &[u8],
    now: i64,
    tolerance_secs: u64,
) -> Result<(), SignatureError> {
    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| SignatureError::MalformedHeader {
            header: TIMESTAMP_HEADER,
            reason: e.to_string(),
        })?;
    if ts <= now {
        let age_secs = now.abs_diff(ts);
        if age_secs > tolerance_secs {
            return Err(SignatureError::Expired { age_secs });
        }
    } else {
        let skew_secs = ts.abs_diff(now);
        if skew_secs > tolerance_secs {
            return Err(SignatureError::FromFuture { skew_secs });
        }
    }

    let digest = signature
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or_else(|| SignatureError::MalformedHeader {
            header: SIGNATURE_HEADER,
            reason: format!("expected {SIGNATURE_PREFIX} prefix"),
        })?;
    let expected = hex::decode(digest).map_err(|e| SignatureError::MalformedHeader {
        header: SIGNATURE_HEADER,
        reason: e.to_string(),
    })?;

    let payload: Value = serde_json::from_slice(body)?;
    let canonical = canonical_json(&payload)?;
    mac_over(secret, ts, &canonical)?
        .verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

/// Verifies a delivery from its request headers.
///
/// Rejects missing or malformed headers, timestamps more than
/// `tolerance_secs` away from `now` and signatures that do not match.
pub fn verify(
    secret: &[u8],
    headers: &HeaderMap,
    body: &[u8],
    now: i64,
    tolerance_secs: u64,
) -> Result<(), SignatureError> {
    let header = |name: &'static str| -> Result<&str, SignatureError> {
        headers
            .get(name)
            .ok_or(SignatureError::MissingHeader(name))?
            .to_str()
            .map_err(|e| SignatureError::MalformedHeader {
                header: name,
                reason: e.to_string(),
            })
    };
    verify_parts(
        secret,
        header(SIGNATURE_HEADER)?,
        header(TIMESTAMP_HEADER)?,
        body,
        now,
        tolerance_secs,
    )
}
