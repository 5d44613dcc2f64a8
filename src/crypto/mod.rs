//! Payload protection.
//!
//! - [`kms`] - [`KeyManagementService`] seam and the in-process [`LocalKms`].
//! - [`envelope`] - [`EnvelopeCodec`] for version 1 and version 2 envelopes.
//! - `aws_kms` - AWS KMS adapter, available behind the `aws` feature flag.

#[cfg(feature = "aws")]
pub mod aws_kms;
pub mod envelope;
pub mod kms;

#[cfg(feature = "aws")]
pub use aws_kms::AwsKms;
pub use envelope::{Envelope, EnvelopeCodec, EnvelopeError, LEGACY_VERSION, SEALED_VERSION};
pub use kms::{KeyManagementService, KmsError, LocalKms};
