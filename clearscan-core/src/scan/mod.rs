//! Scan process supervision.
//!
//! One scanner child is spawned per job against its workspace. Stdout and
//! stderr are drained concurrently with the wait for exit so a chatty child
//! can never stall on a full pipe.

mod buffer;

pub use buffer::{LineSplitter, OutputBuffer, TailBuffer};

use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};
use tracing::{debug, info, warn};

use crate::job::{JobId, ScanReport};

/// Copyright, license and info detection, quiet, JSON report on stdout.
/// The workspace path is appended as the only positional argument.
pub const SCAN_FLAGS: [&str; 5] = ["-clp", "-i", "-q", "--json", "-"];

const READ_CHUNK: usize = 16 * 1024;
const MAX_LOG_LINE: usize = 4096;
const ERROR_TAIL_CHARS: usize = 2048;

/// What to do with a scanner that exits non-zero (or is killed by a signal).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitPolicy {
    /// Reject the job, attaching the scanner's stderr.
    #[default]
    Fail,
    /// Resolve with whatever stdout was captured.
    Resolve,
}

impl FromStr for ExitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" | "reject" => Ok(ExitPolicy::Fail),
            "resolve" | "ignore" => Ok(ExitPolicy::Resolve),
            other => Err(format!(
                "unknown exit policy '{other}' (expected 'fail' or 'resolve')"
            )),
        }
    }
}

/// How the scanner is invoked and how much of its output is kept.
#[derive(Clone, Debug)]
pub struct ScannerConfig {
    /// Scanner executable, resolved through `PATH` when relative.
    pub program: PathBuf,
    /// Wall-clock limit per scan; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Outcome of a non-zero exit.
    pub exit_policy: ExitPolicy,
    /// Cap on the stdout report. Larger reports fail the job.
    pub max_report_bytes: usize,
    /// How much of the end of stderr is kept for error messages.
    pub max_diagnostic_bytes: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("scancode"),
            timeout: None,
            exit_policy: ExitPolicy::Fail,
            max_report_bytes: 256 * 1024 * 1024,
            max_diagnostic_bytes: 64 * 1024,
        }
    }
}

/// Ways a single scan can fail.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The executable could not be started.
    #[error("failed to spawn scanner {}: {source}", program.display())]
    Spawn {
        /// Executable that failed to start.
        program: PathBuf,
        /// Spawn failure.
        #[source]
        source: io::Error,
    },

    /// Reading a pipe or waiting on the child failed.
    #[error("failed to collect scanner output: {0}")]
    Io(#[from] io::Error),

    /// Non-zero exit or death by signal under [`ExitPolicy::Fail`].
    /// `stderr` holds the end of the scanner's diagnostics.
    #[error("scanner exited unsuccessfully ({status}): {stderr}")]
    NonZeroExit {
        /// How the scanner ended.
        status: ExitStatus,
        /// Last lines of stderr.
        stderr: String,
    },

    /// The scanner ran past its timeout and was killed.
    #[error("scanner did not finish within {after:?}: {stderr}")]
    TimedOut {
        /// The timeout that expired.
        after: Duration,
        /// Last lines of stderr up to the kill.
        stderr: String,
    },

    /// Stdout grew past [`ScannerConfig::max_report_bytes`].
    #[error("scanner report exceeded {limit} bytes")]
    ReportTooLarge {
        /// Configured cap in bytes.
        limit: usize,
    },

    /// Stdout could not be decoded as UTF-8.
    #[error("scanner report is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Everything a finished scanner left behind.
#[derive(Debug)]
pub struct ScanOutcome {
    /// Child pid, when the OS reported one.
    pub pid: Option<u32>,
    /// Exit status from `wait`.
    pub status: ExitStatus,
    /// Head of stdout, capped at the report limit.
    pub stdout: OutputBuffer,
    /// Tail of stderr, capped at the diagnostic limit.
    pub stderr: TailBuffer,
}

/// Spawns and supervises scanner processes.
#[derive(Clone, Debug)]
pub struct ScanSupervisor {
    config: ScannerConfig,
}

impl ScanSupervisor {
    /// Supervisor running scans with `config`.
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Configuration this supervisor was built with.
    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Full argument list handed to the scanner for `workspace`.
    pub fn command_args(workspace: &Path) -> Vec<OsString> {
        SCAN_FLAGS
            .iter()
            .map(OsString::from)
            .chain(std::iter::once(workspace.as_os_str().to_os_string()))
            .collect()
    }

    fn command(&self, workspace: &Path) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(Self::command_args(workspace))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Runs the scanner and applies the exit policy to its outcome.
    pub async fn scan(
        &self,
        job_id: &JobId,
        workspace: &Path,
    ) -> Result<ScanReport, ScanError> {
        let outcome = self.run(job_id, workspace).await?;
        self.report(job_id, outcome)
    }

    /// Spawns the scanner once and collects both streams until it exits.
    /// Never retries.
    pub async fn run(
        &self,
        job_id: &JobId,
        workspace: &Path,
    ) -> Result<ScanOutcome, ScanError> {
        let mut child =
            self.command(workspace)
                .spawn()
                .map_err(|source| ScanError::Spawn {
                    program: self.config.program.clone(),
                    source,
                })?;
        let pid = child.id();
        info!(
            job_id = %job_id,
            pid,
            workspace = %workspace.display(),
            "scanner started"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("scanner stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("scanner stderr was not captured"))?;

        let mut report = OutputBuffer::with_limit(self.config.max_report_bytes);
        let mut diagnostics =
            TailBuffer::with_limit(self.config.max_diagnostic_bytes);

        let collect = async {
            let (out, err, status) = tokio::join!(
                drain(stdout, &mut report),
                drain_logged(stderr, &mut diagnostics, job_id, pid),
                child.wait(),
            );
            out?;
            err?;
            status
        };

        let status = match self.config.timeout {
            None => collect.await?,
            Some(limit) => {
                let waited = tokio::time::timeout(limit, collect).await;
                match waited {
                    Ok(status) => status?,
                    Err(_) => {
                        warn!(
                            job_id = %job_id,
                            pid,
                            timeout = ?limit,
                            "scanner timed out; killing it"
                        );
                        if let Err(err) = child.kill().await {
                            warn!(job_id = %job_id, pid, error = %err, "failed to kill scanner");
                        }
                        return Err(ScanError::TimedOut {
                            after: limit,
                            stderr: diagnostics.tail_lossy(ERROR_TAIL_CHARS),
                        });
                    }
                }
            }
        };

        debug!(
            job_id = %job_id,
            pid,
            %status,
            stdout_bytes = report.len(),
            stderr_bytes = diagnostics.len(),
            "scanner exited"
        );

        Ok(ScanOutcome {
            pid,
            status,
            stdout: report,
            stderr: diagnostics,
        })
    }

    /// Turns a finished scan into the job's report according to the
    /// configured [`ExitPolicy`].
    pub fn report(
        &self,
        job_id: &JobId,
        outcome: ScanOutcome,
    ) -> Result<ScanReport, ScanError> {
        if !outcome.status.success() {
            match self.config.exit_policy {
                ExitPolicy::Fail => {
                    return Err(ScanError::NonZeroExit {
                        status: outcome.status,
                        stderr: outcome.stderr.tail_lossy(ERROR_TAIL_CHARS),
                    });
                }
                ExitPolicy::Resolve => warn!(
                    job_id = %job_id,
                    pid = outcome.pid,
                    status = %outcome.status,
                    "scanner exited unsuccessfully; resolving with captured stdout"
                ),
            }
        }

        if outcome.stdout.overflowed() {
            return Err(ScanError::ReportTooLarge {
                limit: outcome.stdout.limit(),
            });
        }

        let result = String::from_utf8(outcome.stdout.into_bytes())?;
        Ok(ScanReport { result })
    }
}

async fn drain<R>(mut reader: R, buffer: &mut OutputBuffer) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buffer.push(&chunk[..read]);
    }
}

/// Keeps the tail of the stream and logs each line as it arrives, tagged
/// with the child pid so concurrent scans can be told apart. Lines longer
/// than [`MAX_LOG_LINE`] are logged in pieces.
async fn drain_logged<R>(
    mut reader: R,
    buffer: &mut TailBuffer,
    job_id: &JobId,
    pid: Option<u32>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new(MAX_LOG_LINE);
    let mut log_line = |line: &[u8]| {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if !text.is_empty() {
            warn!(job_id = %job_id, pid, "scanner: {text}");
        }
    };

    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            splitter.finish(&mut log_line);
            return Ok(());
        }
        buffer.push(&chunk[..read]);
        splitter.feed(&chunk[..read], &mut log_line);
    }
}
