//! S3-backed [`ObjectStore`] implementation.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::debug;

use super::{ObjectStore, StoreError};

/// High-level wrapper around the S3 bucket holding cached build artifacts.
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Store {
    /// Create a new `S3Store` from an already-configured [`Client`] and the
    /// application-level S3 config section.
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Build the full S3 object key for a cache key.
    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get_object(&self, key: &str) -> Result<Bytes, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map_or(false, |e| e.is_no_such_key())
                {
                    StoreError::NotFound
                } else {
                    classify(err)
                }
            })?;

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Other {
                status: None,
                message: format!("read GetObject body: {e}"),
            })?
            .into_bytes();

        debug!(%key, size = bytes.len(), "object downloaded");
        Ok(bytes)
    }

    async fn head_object(&self, key: &str) -> Result<(), StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                // HEAD failures carry no body, so the SDK exposes a dedicated
                // not-found probe instead of an error code.
                if err.as_service_error().map_or(false, |e| e.is_not_found()) {
                    Err(StoreError::NotFound)
                } else {
                    Err(classify(err))
                }
            }
        }
    }

    async fn put_object(&self, key: &str, source: &Path) -> Result<(), StoreError> {
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| StoreError::Local(std::io::Error::other(e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .acl(ObjectCannedAcl::BucketOwnerFullControl)
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        debug!(%key, "object uploaded");
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(classify)?;

        debug!(%key, "object deleted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Classify an SDK failure into the store-error taxonomy the router's
/// response policy switches on.
fn classify<E>(err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = ctx.err().code().unwrap_or_default();
            let message = ctx.err().message().unwrap_or_default();
            if code == "ExpiredToken" || code == "ExpiredTokenException" {
                StoreError::ExpiredCredentials(message.to_string())
            } else if status == 404 || code == "NoSuchKey" {
                StoreError::NotFound
            } else if status >= 500 || code == "SlowDown" || code == "RequestTimeout" {
                StoreError::Retryable(format!("{code}: {message}"))
            } else {
                StoreError::Other {
                    status: Some(status),
                    message: format!("{code}: {message}"),
                }
            }
        }
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            StoreError::Retryable(err.to_string())
        }
        _ => StoreError::Other {
            status: None,
            message: err.to_string(),
        },
    }
}
