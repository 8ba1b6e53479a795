//! Object-store abstraction layer.
//!
//! The router dispatches every remote operation through the [`ObjectStore`]
//! trait so that no S3-specific request construction or error parsing leaks
//! outside this module, and so tests can substitute an in-memory store.

pub mod s3;

pub use s3::S3Store;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// A remote-store outcome, pre-classified for the router's response policy.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store reports no object under the key.
    #[error("object not found")]
    NotFound,

    /// The store rejected the credentials. Restarting the process (under a
    /// supervisor that reloads credentials) is the only remediation.
    #[error("expired credentials: {0}")]
    ExpiredCredentials(String),

    /// Transient network or service failure.
    #[error("transient store error: {0}")]
    Retryable(String),

    /// Any other remote failure, with the remote HTTP status when present.
    #[error("store error: {message}")]
    Other { status: Option<u16>, message: String },

    /// The request never reached the network.
    #[error("local i/o error: {0}")]
    Local(#[from] std::io::Error),
}

impl StoreError {
    /// The remote HTTP status carried by the error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            StoreError::Other { status, .. } => *status,
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The four remote operations the proxy issues. Implementations never retry;
/// retry policy belongs to the caller's circuit breaker.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object's full body.
    async fn get_object(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Probe for an object's existence.
    async fn head_object(&self, key: &str) -> Result<(), StoreError>;

    /// Upload a spooled file under `key`.
    async fn put_object(&self, key: &str, source: &Path) -> Result<(), StoreError>;

    /// Delete the object under `key`.
    async fn delete_object(&self, key: &str) -> Result<(), StoreError>;
}
