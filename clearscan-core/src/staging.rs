//! Downloading a job's blobs into its workspace.

use futures::{TryStreamExt, stream};
use std::{collections::HashMap, io, path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    job::Job,
    storage::{ObjectStore, StorageError},
    workspace::{Workspace, WorkspaceError},
};

/// Why a job's files could not be staged.
#[derive(Error, Debug)]
pub enum StagingError {
    /// A destination path would leave the workspace.
    #[error("{0}")]
    UnsafePath(#[from] WorkspaceError),

    /// Two entries claim the same destination with different blobs.
    #[error("conflicting entries for {path}: {first} and {second}")]
    ConflictingEntries {
        /// Normalised destination both entries map to.
        path: String,
        /// Key of the entry seen first.
        first: String,
        /// Key of the entry that clashed with it.
        second: String,
    },

    /// Fetching a blob failed.
    #[error("download of {key} for {path} failed: {source}")]
    Download {
        /// Object key of the blob.
        key: String,
        /// Destination the blob was meant for.
        path: String,
        /// Storage failure.
        #[source]
        source: StorageError,
    },

    /// Writing a downloaded blob into the workspace failed.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// File being written.
        path: PathBuf,
        /// Filesystem failure.
        #[source]
        source: io::Error,
    },
}

/// Materialises a job's files inside its workspace.
#[derive(Debug, Clone)]
pub struct Stager {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    concurrency: usize,
}

struct Placement {
    key: String,
    relative: String,
    destination: PathBuf,
}

impl Stager {
    /// Stager fetching from `bucket` with up to `concurrency` downloads at
    /// once per job. A concurrency of zero is treated as one.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            concurrency: concurrency.max(1),
        }
    }

    /// Downloads every file of `job` into `workspace`.
    ///
    /// All paths are checked before the first download. The first failing
    /// download aborts the whole staging: downloads still in flight are
    /// dropped and no further ones are started. Returns the number of files
    /// written.
    pub async fn stage(
        &self,
        job: &Job,
        workspace: &Workspace,
    ) -> Result<usize, StagingError> {
        let placements = plan(job, workspace)?;
        let count = placements.len();
        info!(
            job_id = %job.id,
            files = count,
            bucket = %self.bucket,
            "staging job files"
        );

        stream::iter(placements.into_iter().map(Ok))
            .try_for_each_concurrent(self.concurrency, |placement| {
                self.fetch(placement)
            })
            .await?;

        debug!(job_id = %job.id, files = count, "staging complete");
        Ok(count)
    }

    async fn fetch(&self, placement: Placement) -> Result<(), StagingError> {
        let bytes = self
            .store
            .download(&self.bucket, &placement.key)
            .await
            .map_err(|source| StagingError::Download {
                key: placement.key.clone(),
                path: placement.relative.clone(),
                source,
            })?;

        if let Some(parent) = placement.destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| {
                StagingError::Write {
                    path: parent.to_path_buf(),
                    source,
                }
            })?;
        }
        tokio::fs::write(&placement.destination, &bytes)
            .await
            .map_err(|source| StagingError::Write {
                path: placement.destination.clone(),
                source,
            })
    }
}

/// Resolves every entry to its destination, in list order. Repeated entries
/// for the same path are collapsed when they agree on the blob and rejected
/// when they don't, so the outcome never depends on download order.
fn plan(job: &Job, workspace: &Workspace) -> Result<Vec<Placement>, StagingError> {
    let mut seen: HashMap<PathBuf, &str> = HashMap::new();
    let mut placements = Vec::with_capacity(job.files.len());

    for file in &job.files {
        let destination = workspace.resolve(&file.path)?;
        if let Some(previous) = seen.get(&destination) {
            if *previous == file.hash {
                continue;
            }
            return Err(StagingError::ConflictingEntries {
                path: file.path.clone(),
                first: previous.to_string(),
                second: file.hash.clone(),
            });
        }
        seen.insert(destination.clone(), &file.hash);
        placements.push(Placement {
            key: file.hash.clone(),
            relative: file.path.clone(),
            destination,
        });
    }

    Ok(placements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        job::{JobFile, JobId},
        storage::{FsObjectStore, StorageResult},
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn seeded_store(blobs: &[(&str, &[u8])]) -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        for (key, bytes) in blobs {
            store.upload("blobs", key, bytes.to_vec()).await.unwrap();
        }
        (dir, store)
    }

    #[tokio::test]
    async fn writes_files_at_their_relative_paths() {
        let (_blobs, store) =
            seeded_store(&[("abc", b"hello"), ("def", b"world")]).await;
        let scratch = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(scratch.path(), &JobId::new("42"))
            .await
            .unwrap();

        let job = Job::new(
            "42",
            vec![
                JobFile::new("abc", "a.txt"),
                JobFile::new("def", "deep/nested/b.txt"),
            ],
        );
        let stager = Stager::new(Arc::new(store), "blobs", 4);
        let staged = stager.stage(&job, &workspace).await.unwrap();

        assert_eq!(staged, 2);
        let root = scratch.path().join("42");
        assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), b"hello");
        assert_eq!(
            std::fs::read(root.join("deep/nested/b.txt")).unwrap(),
            b"world"
        );
        workspace.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn missing_blob_fails_staging() {
        let (_blobs, store) = seeded_store(&[("abc", b"hello")]).await;
        let scratch = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(scratch.path(), &JobId::new("42"))
            .await
            .unwrap();

        let job = Job::new("42", vec![JobFile::new("missing", "a.txt")]);
        let stager = Stager::new(Arc::new(store), "blobs", 1);
        let err = stager.stage(&job, &workspace).await.unwrap_err();

        match err {
            StagingError::Download { key, source, .. } => {
                assert_eq!(key, "missing");
                assert!(source.is_not_found());
            }
            other => panic!("unexpected error: {other}"),
        }
        workspace.cleanup().await.unwrap();
    }

    #[derive(Debug, Default)]
    struct CountingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for CountingStore {
        async fn download(&self, bucket: &str, key: &str) -> StorageResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        }

        async fn upload(&self, _: &str, _: &str, _: Vec<u8>) -> StorageResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_failure_stops_remaining_downloads() {
        let store = Arc::new(CountingStore::default());
        let scratch = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(scratch.path(), &JobId::new("5"))
            .await
            .unwrap();

        let files = (0..10)
            .map(|i| JobFile::new(format!("k{i}"), format!("f{i}")))
            .collect();
        let job = Job::new("5", files);
        let stager = Stager::new(store.clone(), "blobs", 1);

        assert!(stager.stage(&job, &workspace).await.is_err());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        workspace.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn unsafe_path_fails_before_any_download() {
        let store = Arc::new(CountingStore::default());
        let scratch = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(scratch.path(), &JobId::new("6"))
            .await
            .unwrap();

        let job = Job::new(
            "6",
            vec![
                JobFile::new("abc", "ok.txt"),
                JobFile::new("def", "../../etc/passwd"),
            ],
        );
        let stager = Stager::new(store.clone(), "blobs", 4);

        let err = stager.stage(&job, &workspace).await.unwrap_err();
        assert!(matches!(err, StagingError::UnsafePath(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        workspace.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_entries_collapse_or_conflict() {
        let (_blobs, store) = seeded_store(&[("abc", b"hello")]).await;
        let scratch = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(scratch.path(), &JobId::new("8"))
            .await
            .unwrap();
        let stager = Stager::new(Arc::new(store), "blobs", 2);

        let same = Job::new(
            "8",
            vec![JobFile::new("abc", "a.txt"), JobFile::new("abc", "./a.txt")],
        );
        assert_eq!(stager.stage(&same, &workspace).await.unwrap(), 1);

        let conflicting = Job::new(
            "8",
            vec![JobFile::new("abc", "a.txt"), JobFile::new("zzz", "a.txt")],
        );
        let err = stager.stage(&conflicting, &workspace).await.unwrap_err();
        assert!(matches!(err, StagingError::ConflictingEntries { .. }));
        workspace.cleanup().await.unwrap();
    }
}
