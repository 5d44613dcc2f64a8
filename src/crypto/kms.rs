//! Key-management service seam.
//!
//! A [`KeyManagementService`] wraps and unwraps small secrets (data
//! encryption keys) under a key that never leaves the service. Real services
//! cap the plaintext they accept per call, which is why payloads are
//! envelope-encrypted instead of sent to the service directly.

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of an AES-GCM nonce in bytes.
pub const NONCE_LEN: usize = 12;

/// Plaintext limit of [`LocalKms`], matching common managed services.
pub const LOCAL_KMS_MAX_PLAINTEXT: usize = 64 * 1024;

/// Errors raised by a key-management service.
#[derive(Debug, Error)]
pub enum KmsError {
    /// The plaintext exceeds what the service accepts in one call.
    #[error("plaintext of {actual} bytes exceeds key-management limit of {limit} bytes")]
    PlaintextTooLarge {
        /// Service limit in bytes.
        limit: usize,
        /// Submitted size in bytes.
        actual: usize,
    },

    /// The service rejected or could not authenticate the ciphertext.
    #[error("key-management decrypt rejected the ciphertext")]
    InvalidCiphertext,

    /// The service was unreachable or returned an error.
    #[error("key-management service error: {message}")]
    Service {
        /// Description of the failure.
        message: String,
        /// Underlying error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// A key-management service that can wrap and unwrap small secrets.
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// task a process handles.
#[async_trait]
pub trait KeyManagementService: Send + Sync {
    /// Largest plaintext accepted by [`encrypt`](Self::encrypt).
    fn max_plaintext_bytes(&self) -> usize;

    /// Encrypts `plaintext` under the service key.
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Decrypts a ciphertext produced by [`encrypt`](Self::encrypt).
    ///
    /// The returned buffer is zeroized on drop.
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, KmsError>;
}

/// In-process key-management service backed by a 256-bit master key.
///
/// Ciphertexts are `nonce || AES-256-GCM(master, plaintext)`. Useful for
/// tests and single-host deployments where the master key is provisioned
/// out of band (for example from a mounted secret).
///
/// # Examples
///
/// ```
/// use task_handoff::crypto::{KeyManagementService, LocalKms};
///
/// # tokio_test_block_on(async {
/// let kms = LocalKms::generate();
/// let wrapped = kms.encrypt(b"small secret").await.unwrap();
/// let unwrapped = kms.decrypt(&wrapped).await.unwrap();
/// assert_eq!(unwrapped.as_slice(), b"small secret");
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub struct LocalKms {
    master: Zeroizing<[u8; 32]>,
    max_plaintext: usize,
}

impl LocalKms {
    /// Creates a service from an existing 32-byte master key.
    pub fn new(master: [u8; 32]) -> Self {
        Self {
            master: Zeroizing::new(master),
            max_plaintext: LOCAL_KMS_MAX_PLAINTEXT,
        }
    }

    /// Creates a service with a freshly generated master key.
    pub fn generate() -> Self {
        let mut master = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(master.as_mut_slice());
        Self {
            master,
            max_plaintext: LOCAL_KMS_MAX_PLAINTEXT,
        }
    }

    /// Parses a hex-encoded 32-byte master key.
    pub fn from_hex(hex_key: &str) -> Result<Self, KmsError> {
        let bytes = Zeroizing::new(hex::decode(hex_key.trim()).map_err(|e| KmsError::Service {
            message: "master key is not valid hex".to_string(),
            source: Some(Box::new(e)),
        })?);
        let master: [u8; 32] = bytes.as_slice().try_into().map_err(|_| KmsError::Service {
            message: format!("master key must be 32 bytes, got {}", bytes.len()),
            source: None,
        })?;
        Ok(Self::new(master))
    }

    /// Overrides the plaintext limit (useful to model stricter services).
    pub fn with_max_plaintext(mut self, limit: usize) -> Self {
        self.max_plaintext = limit;
        self
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.master.as_slice()))
    }
}

impl fmt::Debug for LocalKms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKms")
            .field("master", &"[REDACTED]")
            .field("max_plaintext", &self.max_plaintext)
            .finish()
    }
}

#[async_trait]
impl KeyManagementService for LocalKms {
    fn max_plaintext_bytes(&self) -> usize {
        self.max_plaintext
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        if plaintext.len() > self.max_plaintext {
            return Err(KmsError::PlaintextTooLarge {
                limit: self.max_plaintext,
                actual: plaintext.len(),
            });
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher()
            .encrypt(&nonce, plaintext)
            .map_err(|_| KmsError::Service {
                message: "local key wrap failed".to_string(),
                source: None,
            })?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(KmsError::InvalidCiphertext);
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map(Zeroizing::new)
            .map_err(|_| KmsError::InvalidCiphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wrap_unwrap_round_trip() {
        let kms = LocalKms::generate();
        let wrapped = kms.encrypt(&[7u8; 32]).await.unwrap();
        assert_eq!(wrapped.len(), NONCE_LEN + 32 + 16);
        assert_eq!(kms.decrypt(&wrapped).await.unwrap().as_slice(), &[7u8; 32]);
    }

    #[tokio::test]
    async fn enforces_plaintext_limit() {
        let kms = LocalKms::generate().with_max_plaintext(16);
        let err = kms.encrypt(&[0u8; 17]).await.unwrap_err();
        assert!(matches!(
            err,
            KmsError::PlaintextTooLarge {
                limit: 16,
                actual: 17
            }
        ));
    }

    #[tokio::test]
    async fn other_master_key_cannot_unwrap() {
        let a = LocalKms::generate();
        let b = LocalKms::generate();
        let wrapped = a.encrypt(b"dek").await.unwrap();
        assert!(matches!(
            b.decrypt(&wrapped).await,
            Err(KmsError::InvalidCiphertext)
        ));
    }

    #[tokio::test]
    async fn truncated_ciphertext_is_rejected() {
        let kms = LocalKms::generate();
        assert!(matches!(
            kms.decrypt(&[1, 2, 3]).await,
            Err(KmsError::InvalidCiphertext)
        ));
    }

    #[test]
    fn from_hex_validates_length() {
        assert!(LocalKms::from_hex(&"ab".repeat(32)).is_ok());
        assert!(LocalKms::from_hex("abcd").is_err());
        assert!(LocalKms::from_hex("zz").is_err());
    }

    #[test]
    fn debug_redacts_master_key() {
        let kms = LocalKms::new([0x42; 32]);
        let rendered = format!("{kms:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("66"));
    }
}
