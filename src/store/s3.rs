//! Amazon S3 object backend.
//!
//! [`S3Backend`] maps [`ObjectBackend`] onto `PutObject`, `GetObject`,
//! `HeadObject`, `DeleteObject` and `ListObjectsV2`. `put_if_absent` uses a
//! conditional write (`If-None-Match: *`), which S3 rejects with
//! `412 Precondition Failed` when the key exists.
//!
//! Like every backend this is a dumb adapter; the task layout and status
//! rules live in [`TaskStore`](crate::store::TaskStore).
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use task_handoff::store::{S3Backend, TaskStore};
//!
//! # async fn example() {
//! let backend = S3Backend::from_env("handoff-artifacts").await.with_root("prod");
//! let store = TaskStore::new(Arc::new(backend));
//! # }
//! ```

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use super::backend::{validate_key, ObjectBackend, StorageError};

const PRECONDITION_FAILED: u16 = 412;

/// S3 object backend bound to one bucket and optional key root.
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
    root: String,
}

impl S3Backend {
    /// Creates a backend with a pre-built client.
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            root: String::new(),
        }
    }

    /// Creates a backend from the standard AWS configuration chain.
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), bucket)
    }

    /// Places every key under `root/` inside the bucket.
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        let root = root.into();
        let trimmed = root.trim_matches('/');
        self.root = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };
        self
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{key}", self.root)
    }

    fn backend_error<E>(action: &str, key: &str, err: E) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StorageError::Backend {
            message: format!("S3 {action} {key} failed: {}", DisplayErrorContext(&err)),
            source: Some(Box::new(err)),
        }
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| Self::backend_error("PutObject", key, e))?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<bool, StorageError> {
        validate_key(key)?;
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .if_none_match("*")
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e)
                if e.raw_response()
                    .is_some_and(|r| r.status().as_u16() == PRECONDITION_FAILED) =>
            {
                Ok(false)
            },
            Err(e) => Err(Self::backend_error("PutObject", key, e)),
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::NotFound {
                        key: key.to_string(),
                    }
                } else {
                    Self::backend_error("GetObject", key, e)
                }
            })?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| Self::backend_error("read body of", key, e))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        // DeleteObject succeeds for missing keys, so check with HEAD first.
        let existed = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => false,
            Err(e) => return Err(Self::backend_error("HeadObject", key, e)),
        };
        if existed {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(self.object_key(key))
                .send()
                .await
                .map_err(|e| Self::backend_error("DeleteObject", key, e))?;
        }
        Ok(existed)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.object_key(prefix))
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| Self::backend_error("ListObjectsV2", prefix, e))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter_map(|key| key.strip_prefix(self.root.as_str()))
                    .map(str::to_string),
            );
        }
        keys.sort();
        Ok(keys)
    }

    fn uri_for(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.object_key(key))
    }
}
