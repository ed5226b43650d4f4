#![allow(dead_code)]

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clearscan_core::{
    ConsumerConfig, ExitPolicy, FsObjectStore, JobProcessor, ObjectStore,
    ProcessorConfig, ScannerConfig,
};
use tempfile::TempDir;

pub const BUCKET: &str = "blobs";

/// Writes an executable `#!/bin/sh` stand-in for the scanning tool.
/// The workspace directory arrives as `$6`.
pub fn fake_scanner(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .unwrap();
    path
}

pub async fn blob_store(blobs: &[(&str, &str)]) -> (TempDir, Arc<FsObjectStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = FsObjectStore::new(dir.path());
    for (key, contents) in blobs {
        store
            .upload(BUCKET, key, contents.as_bytes().to_vec())
            .await
            .unwrap();
    }
    (dir, Arc::new(store))
}

pub fn processor(
    scratch_dir: &Path,
    store: Arc<dyn ObjectStore>,
    program: PathBuf,
    exit_policy: ExitPolicy,
) -> Arc<JobProcessor> {
    processor_with_scanner(
        scratch_dir,
        store,
        ScannerConfig {
            program,
            exit_policy,
            timeout: Some(Duration::from_secs(30)),
            ..ScannerConfig::default()
        },
    )
}

pub fn processor_with_scanner(
    scratch_dir: &Path,
    store: Arc<dyn ObjectStore>,
    scanner: ScannerConfig,
) -> Arc<JobProcessor> {
    Arc::new(JobProcessor::new(
        ProcessorConfig {
            scratch_dir: scratch_dir.to_path_buf(),
            bucket: BUCKET.to_string(),
            download_concurrency: 4,
            scanner,
        },
        store,
    ))
}

pub fn consumer_config(max_jobs: usize) -> ConsumerConfig {
    ConsumerConfig {
        max_jobs,
        poll_wait: Duration::from_millis(50),
        lock_renew_interval: Duration::from_millis(100),
        stalled_interval: None,
        error_backoff: Duration::from_millis(50),
    }
}

/// Entries left in the scratch directory.
pub fn leftovers(scratch_dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(scratch_dir) {
        Ok(entries) => entries.map(|entry| entry.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}
