//! Object storage access.
//!
//! The worker only needs two calls: fetch a blob by content key into memory
//! and store a local file under a key. Neither retries; callers own the
//! retry policy.

mod fs;
mod s3;

pub use fs::FsObjectStore;
pub use s3::{S3Config, S3Credentials, S3ObjectStore, signing_key};

use async_trait::async_trait;
use std::{fmt, io, path::PathBuf};
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Object storage failures.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No object exists under the key.
    #[error("object {bucket}/{key} not found")]
    NotFound {
        /// Bucket that was searched.
        bucket: String,
        /// Missing key.
        key: String,
    },

    /// Credentials were rejected (HTTP 401 or 403).
    #[error("access to {bucket}/{key} denied (HTTP {status})")]
    Unauthorized {
        /// Bucket of the request.
        bucket: String,
        /// Key of the request.
        key: String,
        /// HTTP status returned.
        status: u16,
    },

    /// The request never produced a response.
    #[error("object storage request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Any other non-success response.
    #[error("object storage returned HTTP {status} for {bucket}/{key}: {body}")]
    Status {
        /// Bucket of the request.
        bucket: String,
        /// Key of the request.
        key: String,
        /// HTTP status returned.
        status: u16,
        /// Start of the response body.
        body: String,
    },

    /// The key cannot be addressed safely.
    #[error("invalid object key {0:?}")]
    InvalidKey(String),

    /// The configured endpoint is not a usable base URL.
    #[error("invalid object storage endpoint: {0}")]
    InvalidEndpoint(String),

    /// Local filesystem failure in [`FsObjectStore`].
    #[error("object storage I/O failed for {}: {source}", path.display())]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// Whether the object simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Blob storage addressed by bucket and key. Implementations must be safe to
/// share between concurrently running jobs.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Fetches the full contents of `bucket/key`.
    async fn download(&self, bucket: &str, key: &str) -> StorageResult<Vec<u8>>;

    /// Stores `bytes` at `bucket/key`, replacing any previous object.
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> StorageResult<()>;
}
