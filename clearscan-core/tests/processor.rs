#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use clearscan_core::{
    ExitPolicy, Job, JobError, JobFile, ScanError, ScannerConfig, StagingError,
};
use common::{
    blob_store, fake_scanner, leftovers, processor, processor_with_scanner,
};

#[tokio::test]
async fn staged_files_are_in_place_before_the_scan_starts() {
    let tools = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let (_blobs, store) = blob_store(&[("abc", "hello")]).await;
    let scanner = fake_scanner(tools.path(), "scan", r#"cat "$6/a.txt""#);
    let processor = processor(scratch.path(), store, scanner, ExitPolicy::Fail);

    let job = Job::new("42", vec![JobFile::new("abc", "a.txt")]);
    let report = processor.process(&job).await.unwrap();

    assert_eq!(report.result, "hello");
    assert!(!scratch.path().join("42").exists());
}

#[tokio::test]
async fn missing_blob_rejects_without_running_the_scanner() {
    let tools = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let (_blobs, store) = blob_store(&[("other", "x")]).await;
    let marker = tools.path().join("scanner-ran");
    let scanner = fake_scanner(
        tools.path(),
        "scan",
        &format!("touch '{}'", marker.display()),
    );
    let processor = processor(scratch.path(), store, scanner, ExitPolicy::Fail);

    let job = Job::new(
        "42",
        vec![
            JobFile::new("other", "present.txt"),
            JobFile::new("abc", "a.txt"),
        ],
    );
    let err = processor.process(&job).await.unwrap_err();

    match &err {
        JobError::Staging(StagingError::Download { key, source, .. }) => {
            assert_eq!(key, "abc");
            assert!(source.is_not_found());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.phase(), "staging");
    assert!(!marker.exists(), "scanner must not run after a failed staging");
    assert!(!scratch.path().join("42").exists());
}

#[tokio::test]
async fn resolves_with_the_scanner_stdout() {
    let tools = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let (_blobs, store) = blob_store(&[("abc", "a"), ("def", "b")]).await;
    let scanner = fake_scanner(tools.path(), "scan", r#"printf '{"files":[]}'"#);
    let processor = processor(scratch.path(), store, scanner, ExitPolicy::Fail);

    let job = Job::new(
        "7",
        vec![JobFile::new("abc", "a.txt"), JobFile::new("def", "src/b.txt")],
    );
    let report = processor.process(&job).await.unwrap();

    assert_eq!(report.result, r#"{"files":[]}"#);
    assert!(leftovers(scratch.path()).is_empty());
}

#[tokio::test]
async fn failing_scanner_follows_the_exit_policy() {
    let tools = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let (_blobs, store) = blob_store(&[("abc", "a"), ("def", "b")]).await;
    let scanner = fake_scanner(
        tools.path(),
        "scan",
        "printf 'partial'\necho 'scan aborted: out of memory' >&2\nexit 1",
    );
    let job = Job::new(
        "9",
        vec![JobFile::new("abc", "a.txt"), JobFile::new("def", "b.txt")],
    );

    let strict = processor(
        scratch.path(),
        store.clone(),
        scanner.clone(),
        ExitPolicy::Fail,
    );
    let err = strict.process(&job).await.unwrap_err();
    assert!(matches!(err, JobError::Scan(ScanError::NonZeroExit { .. })));
    let reason = err.to_string();
    assert!(reason.starts_with("scan: scanner exited unsuccessfully"));
    assert!(reason.contains("scan aborted: out of memory"), "{reason}");
    assert!(!scratch.path().join("9").exists());

    let lenient = processor(scratch.path(), store, scanner, ExitPolicy::Resolve);
    let report = lenient.process(&job).await.unwrap();
    assert_eq!(report.result, "partial");
    assert!(!scratch.path().join("9").exists());
}

#[tokio::test]
async fn missing_scanner_binary_is_a_scan_failure() {
    let tools = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let (_blobs, store) = blob_store(&[("abc", "a")]).await;
    let processor = processor(
        scratch.path(),
        store,
        tools.path().join("not-installed"),
        ExitPolicy::Fail,
    );

    let job = Job::new("3", vec![JobFile::new("abc", "a.txt")]);
    let err = processor.process(&job).await.unwrap_err();

    assert!(matches!(err, JobError::Scan(ScanError::Spawn { .. })));
    assert!(leftovers(scratch.path()).is_empty());
}

#[tokio::test]
async fn traversal_paths_are_rejected_and_cleaned_up() {
    let tools = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let (_blobs, store) = blob_store(&[("abc", "a")]).await;
    let scanner = fake_scanner(tools.path(), "scan", "printf '{}'");
    let processor = processor(scratch.path(), store, scanner, ExitPolicy::Fail);

    let job = Job::new("4", vec![JobFile::new("abc", "../../outside.txt")]);
    let err = processor.process(&job).await.unwrap_err();

    assert!(matches!(
        err,
        JobError::Staging(StagingError::UnsafePath(_))
    ));
    assert!(!scratch.path().join("outside.txt").exists());
    assert!(leftovers(scratch.path()).is_empty());
}

#[tokio::test]
async fn invalid_job_id_fails_before_touching_disk() {
    let tools = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let (_blobs, store) = blob_store(&[]).await;
    let scanner = fake_scanner(tools.path(), "scan", "printf '{}'");
    let processor = processor(scratch.path(), store, scanner, ExitPolicy::Fail);

    let err = processor
        .process(&Job::new("../evil", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.phase(), "workspace");
    assert!(leftovers(scratch.path()).is_empty());
}

#[tokio::test]
async fn job_without_files_scans_an_empty_workspace() {
    let tools = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let (_blobs, store) = blob_store(&[]).await;
    let scanner = fake_scanner(tools.path(), "scan", r#"ls -A "$6" | wc -l"#);
    let processor = processor(scratch.path(), store, scanner, ExitPolicy::Fail);

    let report = processor.process(&Job::new("5", vec![])).await.unwrap();
    assert_eq!(report.result.trim(), "0");
}

#[tokio::test]
async fn failed_cleanup_still_resolves_the_job() {
    let tools = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let (_blobs, store) = blob_store(&[("abc", "a")]).await;
    // Swapping the workspace for a plain file makes directory removal fail.
    let scanner = fake_scanner(
        tools.path(),
        "scan",
        "printf done\nrm -rf \"$6\"\necho x > \"$6\"",
    );
    let processor = processor(scratch.path(), store, scanner, ExitPolicy::Fail);

    let job = Job::new("42", vec![JobFile::new("abc", "a.txt")]);
    let report = processor.process(&job).await.unwrap();

    assert_eq!(report.result, "done");
    assert!(scratch.path().join("42").is_file());
}

#[tokio::test]
async fn timed_out_scan_fails_the_job_and_removes_the_workspace() {
    let tools = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let (_blobs, store) = blob_store(&[("abc", "a")]).await;
    let scanner = fake_scanner(tools.path(), "scan", "exec sleep 30");
    let processor = processor_with_scanner(
        scratch.path(),
        store,
        ScannerConfig {
            program: scanner,
            timeout: Some(Duration::from_millis(200)),
            ..ScannerConfig::default()
        },
    );

    let started = Instant::now();
    let job = Job::new("42", vec![JobFile::new("abc", "a.txt")]);
    let err = processor.process(&job).await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(
        matches!(err, JobError::Scan(ScanError::TimedOut { .. })),
        "unexpected error: {err}"
    );
    assert_eq!(err.phase(), "scan");
    assert!(!scratch.path().join("42").exists());
}
