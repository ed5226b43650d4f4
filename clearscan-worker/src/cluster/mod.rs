//! Cluster supervisor: keeps a fixed number of worker processes running.
//!
//! Each slot is watched by its own task. A worker that exits is restarted
//! with backoff, except for one reporting a startup failure, which stops the
//! whole cluster so the operator sees the error.

mod backoff;

pub use backoff::{RestartBackoff, SlotBackoff};

use std::{
    ffi::OsString,
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    process::{Child, Command},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::worker::EXIT_FATAL_STARTUP;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to spawn worker for slot {slot}: {source}")]
    Spawn {
        slot: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for worker in slot {slot}: {source}")]
    Wait {
        slot: usize,
        #[source]
        source: io::Error,
    },

    #[error("worker in slot {slot} failed to start (exit code {code})")]
    FatalStartup { slot: usize, code: i32 },

    #[error("slot supervisor task failed: {0}")]
    Task(String),
}

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub processes: usize,
    /// Binary launched for every slot.
    pub program: PathBuf,
    /// Arguments placed before the per-slot `worker --slot N`.
    pub args: Vec<OsString>,
    /// How long a worker may take to drain after SIGTERM before it is killed.
    pub grace_period: Duration,
    pub backoff: RestartBackoff,
}

impl ClusterConfig {
    pub fn new(processes: usize, program: PathBuf) -> Self {
        Self {
            processes,
            program,
            args: Vec::new(),
            grace_period: Duration::from_secs(30),
            backoff: RestartBackoff::default(),
        }
    }

    fn command(&self, slot: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("worker")
            .arg("--slot")
            .arg(slot.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[derive(Debug)]
pub struct ClusterSupervisor {
    config: Arc<ClusterConfig>,
}

impl ClusterSupervisor {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Runs the cluster until `shutdown` fires or a worker reports a fatal
    /// startup error. Either way every worker has exited on return.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ClusterError> {
        let processes = self.config.processes.max(1);
        info!(
            processes,
            program = %self.config.program.display(),
            "starting worker cluster"
        );

        let stop = shutdown.child_token();
        let mut slots = JoinSet::new();
        for slot in 0..processes {
            slots.spawn(supervise_slot(
                Arc::clone(&self.config),
                slot,
                stop.clone(),
            ));
        }

        let mut first_error = None;
        while let Some(finished) = slots.join_next().await {
            let result = match finished {
                Ok(result) => result,
                Err(err) => Err(ClusterError::Task(err.to_string())),
            };
            if let Err(err) = result {
                if first_error.is_none() {
                    error!(error = %err, "stopping cluster");
                    stop.cancel();
                    first_error = Some(err);
                } else {
                    debug!(error = %err, "additional slot failure");
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("worker cluster stopped");
                Ok(())
            }
        }
    }
}

async fn supervise_slot(
    config: Arc<ClusterConfig>,
    slot: usize,
    stop: CancellationToken,
) -> Result<(), ClusterError> {
    let mut backoff = config.backoff.slot();

    loop {
        if stop.is_cancelled() {
            return Ok(());
        }

        let mut child = config
            .command(slot)
            .spawn()
            .map_err(|source| ClusterError::Spawn { slot, source })?;
        let pid = child.id();
        let started = Instant::now();
        info!(slot, pid, "worker started");

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|source| ClusterError::Wait { slot, source })?
            }
            _ = stop.cancelled() => {
                terminate(&mut child, slot, config.grace_period).await;
                return Ok(());
            }
        };

        if is_fatal(&status) {
            error!(slot, pid, %status, "worker could not start");
            return Err(ClusterError::FatalStartup {
                slot,
                code: EXIT_FATAL_STARTUP,
            });
        }

        let uptime = started.elapsed();
        let delay = backoff.next_delay(uptime);
        warn!(
            slot,
            pid,
            %status,
            uptime_ms = uptime.as_millis() as u64,
            restart_in_ms = delay.as_millis() as u64,
            "worker exited; restarting"
        );

        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn is_fatal(status: &ExitStatus) -> bool {
    status.code() == Some(EXIT_FATAL_STARTUP)
}

/// Asks the worker to drain, then kills it once `grace` has passed.
async fn terminate(child: &mut Child, slot: usize, grace: Duration) {
    request_stop(child, slot);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(slot, %status, "worker stopped"),
        Ok(Err(err)) => warn!(slot, error = %err, "failed to wait for worker"),
        Err(_) => {
            warn!(slot, grace_ms = grace.as_millis() as u64, "worker did not stop in time; killing");
            if let Err(err) = child.kill().await {
                warn!(slot, error = %err, "failed to kill worker");
            }
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child, slot: usize) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(slot, pid, error = %err, "failed to send SIGTERM to worker");
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child, slot: usize) {
    if let Err(err) = child.start_kill() {
        warn!(slot, error = %err, "failed to stop worker");
    }
}
