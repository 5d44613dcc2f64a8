//! AWS KMS key-management adapter.
//!
//! [`AwsKms`] maps [`KeyManagementService`] onto the KMS `Encrypt` and
//! `Decrypt` APIs. KMS accepts at most 4096 bytes of plaintext per call,
//! which is enough for a wrapped DEK and for small legacy payloads.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use task_handoff::crypto::{AwsKms, EnvelopeCodec};
//!
//! # async fn example() {
//! let kms = AwsKms::from_env("alias/task-payloads").await;
//! let codec = EnvelopeCodec::new(Arc::new(kms));
//! # }
//! ```

use async_trait::async_trait;
use aws_sdk_kms::error::DisplayErrorContext;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::Client;
use zeroize::Zeroizing;

use super::kms::{KeyManagementService, KmsError};

/// Plaintext limit of the KMS `Encrypt` API.
pub const AWS_KMS_MAX_PLAINTEXT: usize = 4096;

/// AWS KMS key-management service bound to one key.
#[derive(Debug, Clone)]
pub struct AwsKms {
    client: Client,
    key_id: String,
}

impl AwsKms {
    /// Creates an adapter with a pre-built client.
    pub fn new(client: Client, key_id: impl Into<String>) -> Self {
        Self {
            client,
            key_id: key_id.into(),
        }
    }

    /// Creates an adapter from the standard AWS configuration chain.
    pub async fn from_env(key_id: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), key_id)
    }
}

#[async_trait]
impl KeyManagementService for AwsKms {
    fn max_plaintext_bytes(&self) -> usize {
        AWS_KMS_MAX_PLAINTEXT
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        if plaintext.len() > AWS_KMS_MAX_PLAINTEXT {
            return Err(KmsError::PlaintextTooLarge {
                limit: AWS_KMS_MAX_PLAINTEXT,
                actual: plaintext.len(),
            });
        }
        let output = self
            .client
            .encrypt()
            .key_id(&self.key_id)
            .plaintext(Blob::new(plaintext.to_vec()))
            .send()
            .await
            .map_err(|e| KmsError::Service {
                message: format!("KMS Encrypt failed: {}", DisplayErrorContext(&e)),
                source: Some(Box::new(e)),
            })?;
        output
            .ciphertext_blob()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| KmsError::Service {
                message: "KMS Encrypt returned no ciphertext".to_string(),
                source: None,
            })
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        let output = self
            .client
            .decrypt()
            .key_id(&self.key_id)
            .ciphertext_blob(Blob::new(ciphertext.to_vec()))
            .send()
            .await
            .map_err(|e| {
                let invalid = e
                    .as_service_error()
                    .is_some_and(|se| se.is_invalid_ciphertext_exception());
                if invalid {
                    KmsError::InvalidCiphertext
                } else {
                    KmsError::Service {
                        message: format!("KMS Decrypt failed: {}", DisplayErrorContext(&e)),
                        source: Some(Box::new(e)),
                    }
                }
            })?;
        output
            .plaintext()
            .map(|blob| Zeroizing::new(blob.as_ref().to_vec()))
            .ok_or(KmsError::InvalidCiphertext)
    }
}
