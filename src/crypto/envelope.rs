//! Envelope encryption of task payloads.
//!
//! A payload is serialized to JSON, sealed with a fresh per-task data
//! encryption key (DEK) under AES-256-GCM, and only the DEK is wrapped by
//! the [`KeyManagementService`]. The unwrapped DEK lives in zeroizing memory
//! for the duration of a single call and is never persisted.
//!
//! # Wire Format
//!
//! Envelopes are JSON objects discriminated by an explicit numeric
//! `version` field. Binary fields are standard base64.
//!
//! ```text
//! version 1 (legacy): {"version":1,"ciphertext":"..."}
//! version 2:          {"version":2,"encryptedDek":"...","iv":"...","authTag":"...","encryptedData":"..."}
//! ```
//!
//! Version 1 payloads were wrapped by the key-management service directly
//! and are still readable. New envelopes are always written as version 2.

use std::sync::Arc;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use zeroize::Zeroizing;

use super::kms::{KeyManagementService, KmsError, NONCE_LEN};

/// Envelope version written by [`EnvelopeCodec::encrypt_legacy`].
pub const LEGACY_VERSION: u32 = 1;

/// Envelope version written by [`EnvelopeCodec::encrypt`].
pub const SEALED_VERSION: u32 = 2;

/// Length of the AES-GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

const DEK_LEN: usize = 32;

/// Errors raised while sealing or opening an envelope.
///
/// Every variant is terminal for the task: callers must not attempt partial
/// recovery.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The envelope bytes are not a well-formed envelope.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The `version` field names a format this build does not know.
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),

    /// The key-management service failed to wrap or unwrap the key.
    #[error("key management failed: {0}")]
    Kms(#[from] KmsError),

    /// Authentication of the ciphertext failed (tampering or wrong key).
    #[error("envelope authentication failed")]
    Authentication,

    /// The payload could not be serialized or the plaintext is not JSON.
    #[error("payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A decoded envelope.
///
/// Decoding reads the `version` field first and then matches on it
/// exhaustively, so adding a format means adding a variant here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Version 1: the whole payload wrapped directly by the key service.
    Legacy {
        /// Key-service ciphertext of the serialized payload.
        ciphertext: Vec<u8>,
    },

    /// Version 2: AES-256-GCM payload with a key-service-wrapped DEK.
    Sealed {
        /// DEK wrapped by the key service.
        encrypted_dek: Vec<u8>,
        /// 96-bit AES-GCM nonce.
        iv: Vec<u8>,
        /// 128-bit AES-GCM authentication tag.
        auth_tag: Vec<u8>,
        /// Ciphertext without the tag.
        encrypted_data: Vec<u8>,
    },
}

#[derive(Deserialize)]
struct VersionTag {
    version: u32,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyWire {
    version: u32,
    ciphertext: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedWire {
    version: u32,
    encrypted_dek: String,
    iv: String,
    auth_tag: String,
    encrypted_data: String,
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, EnvelopeError> {
    STANDARD
        .decode(value)
        .map_err(|e| EnvelopeError::Malformed(format!("field {name} is not base64: {e}")))
}

impl Envelope {
    /// Returns the wire version of this envelope.
    pub fn version(&self) -> u32 {
        match self {
            Self::Legacy { .. } => LEGACY_VERSION,
            Self::Sealed { .. } => SEALED_VERSION,
        }
    }

    /// Serializes the envelope to its JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let bytes = match self {
            Self::Legacy { ciphertext } => serde_json::to_vec(&LegacyWire {
                version: LEGACY_VERSION,
                ciphertext: STANDARD.encode(ciphertext),
            })?,
            Self::Sealed {
                encrypted_dek,
                iv,
                auth_tag,
                encrypted_data,
            } => serde_json::to_vec(&SealedWire {
                version: SEALED_VERSION,
                encrypted_dek: STANDARD.encode(encrypted_dek),
                iv: STANDARD.encode(iv),
                auth_tag: STANDARD.encode(auth_tag),
                encrypted_data: STANDARD.encode(encrypted_data),
            })?,
        };
        Ok(bytes)
    }

    /// Parses an envelope from its JSON wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let tag: VersionTag = serde_json::from_slice(bytes)
            .map_err(|e| EnvelopeError::Malformed(format!("missing or invalid version: {e}")))?;

        match tag.version {
            LEGACY_VERSION => {
                let wire: LegacyWire = serde_json::from_slice(bytes)
                    .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
                Ok(Self::Legacy {
                    ciphertext: decode_field("ciphertext", &wire.ciphertext)?,
                })
            },
            SEALED_VERSION => {
                let wire: SealedWire = serde_json::from_slice(bytes)
                    .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
                let envelope = Self::Sealed {
                    encrypted_dek: decode_field("encryptedDek", &wire.encrypted_dek)?,
                    iv: decode_field("iv", &wire.iv)?,
                    auth_tag: decode_field("authTag", &wire.auth_tag)?,
                    encrypted_data: decode_field("encryptedData", &wire.encrypted_data)?,
                };
                envelope.check_lengths()?;
                Ok(envelope)
            },
            other => Err(EnvelopeError::UnsupportedVersion(other)),
        }
    }

    fn check_lengths(&self) -> Result<(), EnvelopeError> {
        if let Self::Sealed { iv, auth_tag, .. } = self {
            if iv.len() != NONCE_LEN {
                return Err(EnvelopeError::Malformed(format!(
                    "iv must be {NONCE_LEN} bytes, got {}",
                    iv.len()
                )));
            }
            if auth_tag.len() != TAG_LEN {
                return Err(EnvelopeError::Malformed(format!(
                    "authTag must be {TAG_LEN} bytes, got {}",
                    auth_tag.len()
                )));
            }
        }
        Ok(())
    }
}

/// Seals and opens task payloads.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use serde_json::json;
/// use task_handoff::crypto::{EnvelopeCodec, LocalKms};
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let codec = EnvelopeCodec::new(Arc::new(LocalKms::generate()));
/// let payload = json!({"prompt": "fix the flaky test", "token": "ghp_secret"});
///
/// let sealed = codec.encrypt(&payload).await.unwrap();
/// assert!(!String::from_utf8_lossy(&sealed).contains("ghp_secret"));
///
/// let opened = codec.decrypt(&sealed).await.unwrap();
/// assert_eq!(opened, payload);
/// # });
/// ```
#[derive(Clone)]
pub struct EnvelopeCodec {
    kms: Arc<dyn KeyManagementService>,
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec").finish_non_exhaustive()
    }
}

impl EnvelopeCodec {
    /// Creates a codec that wraps keys with `kms`.
    pub fn new(kms: Arc<dyn KeyManagementService>) -> Self {
        Self { kms }
    }

    /// Seals a payload into a version 2 envelope.
    ///
    /// The payload size is bounded only by memory; the key service sees
    /// nothing but the 32-byte DEK.
    pub async fn encrypt(&self, payload: &Value) -> Result<Vec<u8>, EnvelopeError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);

        let mut dek = Zeroizing::new([0u8; DEK_LEN]);
        OsRng.fill_bytes(dek.as_mut_slice());
        let encrypted_dek = self.kms.encrypt(dek.as_slice()).await?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut sealed = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(dek.as_slice()))
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| EnvelopeError::Authentication)?;

        let auth_tag = sealed.split_off(sealed.len() - TAG_LEN);
        Envelope::Sealed {
            encrypted_dek,
            iv: nonce.to_vec(),
            auth_tag,
            encrypted_data: sealed,
        }
        .to_bytes()
    }

    /// Seals a payload into a version 1 envelope.
    ///
    /// Only payloads under the key service's plaintext limit can be written
    /// this way; it exists so older readers can still be served.
    pub async fn encrypt_legacy(&self, payload: &Value) -> Result<Vec<u8>, EnvelopeError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
        let ciphertext = self.kms.encrypt(&plaintext).await?;
        Envelope::Legacy { ciphertext }.to_bytes()
    }

    /// Opens an envelope of any supported version.
    ///
    /// Fails closed: any authentication failure is an error, never a
    /// different plaintext.
    pub async fn decrypt(&self, bytes: &[u8]) -> Result<Value, EnvelopeError> {
        match Envelope::from_bytes(bytes)? {
            Envelope::Legacy { ciphertext } => {
                let plaintext = self.kms.decrypt(&ciphertext).await?;
                Ok(serde_json::from_slice(&plaintext)?)
            },
            Envelope::Sealed {
                encrypted_dek,
                iv,
                auth_tag,
                encrypted_data,
            } => {
                let dek = self.kms.decrypt(&encrypted_dek).await?;
                if dek.len() != DEK_LEN {
                    return Err(EnvelopeError::Malformed(format!(
                        "unwrapped key is {} bytes, expected {DEK_LEN}",
                        dek.len()
                    )));
                }
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(dek.as_slice()));

                let mut combined = Vec::with_capacity(encrypted_data.len() + TAG_LEN);
                combined.extend_from_slice(&encrypted_data);
                combined.extend_from_slice(&auth_tag);

                let plaintext = Zeroizing::new(
                    cipher
                        .decrypt(
                            Nonce::from_slice(&iv),
                            Payload {
                                msg: &combined,
                                aad: &[],
                            },
                        )
                        .map_err(|_| EnvelopeError::Authentication)?,
                );
                Ok(serde_json::from_slice(&plaintext)?)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKms;
    use serde_json::json;

    fn codec() -> EnvelopeCodec {
        EnvelopeCodec::new(Arc::new(LocalKms::generate()))
    }

    #[tokio::test]
    async fn sealed_envelope_has_expected_fields() {
        let bytes = codec().encrypt(&json!({"a": 1})).await.unwrap();
        let wire: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(wire["version"], 2);
        for field in ["encryptedDek", "iv", "authTag", "encryptedData"] {
            assert!(wire[field].is_string(), "missing {field}");
        }
        match Envelope::from_bytes(&bytes).unwrap() {
            Envelope::Sealed { iv, auth_tag, .. } => {
                assert_eq!(iv.len(), NONCE_LEN);
                assert_eq!(auth_tag.len(), TAG_LEN);
            },
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_key_and_nonce_per_call() {
        let codec = codec();
        let a = Envelope::from_bytes(&codec.encrypt(&json!("x")).await.unwrap()).unwrap();
        let b = Envelope::from_bytes(&codec.encrypt(&json!("x")).await.unwrap()).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn legacy_envelope_is_readable() {
        let codec = codec();
        let payload = json!({"legacy": true});
        let bytes = codec.encrypt_legacy(&payload).await.unwrap();
        assert_eq!(Envelope::from_bytes(&bytes).unwrap().version(), LEGACY_VERSION);
        assert_eq!(codec.decrypt(&bytes).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn unknown_version_rejected() {
        let err = codec()
            .decrypt(br#"{"version":3,"whatever":"x"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, EnvelopeError::UnsupportedVersion(3)));
    }

    #[tokio::test]
    async fn missing_version_is_malformed() {
        let err = codec().decrypt(br#"{"ciphertext":"AAAA"}"#).await.unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
        let err = codec().decrypt(b"not json").await.unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[tokio::test]
    async fn short_iv_is_malformed() {
        let codec = codec();
        let bytes = codec.encrypt(&json!(1)).await.unwrap();
        let mut wire: Value = serde_json::from_slice(&bytes).unwrap();
        wire["iv"] = Value::String(STANDARD.encode([0u8; 4]));
        let err = codec
            .decrypt(&serde_json::to_vec(&wire).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[tokio::test]
    async fn wrong_kms_fails_closed() {
        let bytes = codec().encrypt(&json!({"k": "v"})).await.unwrap();
        let err = codec().decrypt(&bytes).await.unwrap_err();
        assert!(matches!(err, EnvelopeError::Kms(KmsError::InvalidCiphertext)));
    }
}
