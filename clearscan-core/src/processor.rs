//! One job from workspace creation to cleanup.

use std::{path::PathBuf, sync::Arc, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    error::JobError,
    job::{Job, ScanReport},
    scan::{ScanSupervisor, ScannerConfig},
    staging::Stager,
    storage::ObjectStore,
    workspace::Workspace,
};

/// Settings for a [`JobProcessor`].
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Base directory; each job works in `<scratch_dir>/<job id>`.
    pub scratch_dir: PathBuf,
    /// Bucket every job blob is fetched from.
    pub bucket: String,
    /// Concurrent downloads while staging a single job.
    pub download_concurrency: usize,
    /// How the scanner is run for each job.
    pub scanner: ScannerConfig,
}

/// Runs one job end to end: workspace, staging, scan, cleanup.
///
/// Shared by every in-flight job of a worker process; holds no per-job
/// state of its own.
#[derive(Clone, Debug)]
pub struct JobProcessor {
    scratch_dir: PathBuf,
    stager: Stager,
    scanner: ScanSupervisor,
}

impl JobProcessor {
    /// Processor staging from `store`.
    pub fn new(config: ProcessorConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            stager: Stager::new(
                store,
                config.bucket,
                config.download_concurrency,
            ),
            scanner: ScanSupervisor::new(config.scanner),
            scratch_dir: config.scratch_dir,
        }
    }

    /// Base directory of all workspaces.
    pub fn scratch_dir(&self) -> &std::path::Path {
        &self.scratch_dir
    }

    /// Processes `job` and returns the value it should settle with.
    ///
    /// The workspace is removed before this returns, whatever the outcome.
    /// A failed removal is logged and does not change the result.
    pub async fn process(&self, job: &Job) -> Result<ScanReport, JobError> {
        let started = Instant::now();
        let workspace = Workspace::create(&self.scratch_dir, &job.id).await?;

        let outcome = self.stage_and_scan(job, &workspace).await;

        if let Err(err) = workspace.cleanup().await {
            warn!(
                job_id = %job.id,
                error = %err,
                "failed to remove workspace; settling anyway"
            );
        }

        match &outcome {
            Ok(report) => info!(
                job_id = %job.id,
                report_bytes = report.result.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "job processed"
            ),
            Err(err) => debug!(
                job_id = %job.id,
                phase = err.phase(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "job failed"
            ),
        }
        outcome
    }

    async fn stage_and_scan(
        &self,
        job: &Job,
        workspace: &Workspace,
    ) -> Result<ScanReport, JobError> {
        self.stager.stage(job, workspace).await?;
        Ok(self.scanner.scan(&job.id, workspace.path()).await?)
    }
}
