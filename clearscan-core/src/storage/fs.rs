use async_trait::async_trait;
use std::{
    io,
    path::{Path, PathBuf},
};
use tracing::debug;
use uuid::Uuid;

use super::{ObjectStore, StorageError, StorageResult};
use crate::workspace::safe_relative_path;

/// Object store backed by a local directory: `<root>/<bucket>/<key>`.
///
/// Used for development setups and tests where no S3 endpoint is around.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Store rooted at `root`; bucket directories are created on upload.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the bucket directories.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        let bucket_dir = safe_relative_path(bucket)
            .map_err(|_| StorageError::InvalidKey(bucket.to_string()))?;
        if bucket_dir.components().count() != 1 {
            return Err(StorageError::InvalidKey(bucket.to_string()));
        }
        let key_path = safe_relative_path(key)
            .map_err(|_| StorageError::InvalidKey(key.to_string()))?;
        Ok(self.root.join(bucket_dir).join(key_path))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn download(&self, bucket: &str, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!(bucket, key, size = bytes.len(), "blob read");
                Ok(bytes)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> StorageResult<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| {
                StorageError::Io {
                    path: parent.to_path_buf(),
                    source,
                }
            })?;
        }

        // Write aside and rename so readers never observe a partial blob.
        let staging = path.with_extension(format!("upload-{}", Uuid::new_v4()));
        tokio::fs::write(&staging, &bytes)
            .await
            .map_err(|source| StorageError::Io {
                path: staging.clone(),
                source,
            })?;
        if let Err(source) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(StorageError::Io { path, source });
        }

        debug!(bucket, key, size = bytes.len(), "blob written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store
            .upload("blobs", "ab/cdef", b"hello".to_vec())
            .await
            .unwrap();
        assert!(dir.path().join("blobs/ab/cdef").is_file());

        let bytes = store.download("blobs", "ab/cdef").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        let err = store.download("blobs", "missing").await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("store"));

        let err = store.download("blobs", "../../secret").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));

        let err = store
            .upload("a/b", "key", b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
