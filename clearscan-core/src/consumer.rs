//! The per-process consumer loop.
//!
//! At most `max_jobs` jobs are in flight at once: a slot is taken before
//! each dequeue and only returned after the job has settled, so the queue
//! is never asked for work the process could not start.

use std::{any::Any, sync::Arc, time::Duration};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::{
    error::JobError,
    job::JobLease,
    processor::JobProcessor,
    queue::{QueueError, WorkQueue},
};

const MIN_TICK: Duration = Duration::from_millis(10);

/// Tuning for one [`Consumer`].
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// M: jobs processed concurrently by this process.
    pub max_jobs: usize,
    /// How long a single dequeue call may wait for work.
    pub poll_wait: Duration,
    /// How often the lock of each in-flight job is extended.
    pub lock_renew_interval: Duration,
    /// Period of the stalled-job sweep; `None` disables it.
    pub stalled_interval: Option<Duration>,
    /// Pause after a failed dequeue before asking again.
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_jobs: 1,
            poll_wait: Duration::from_secs(1),
            lock_renew_interval: Duration::from_secs(15),
            stalled_interval: Some(Duration::from_secs(30)),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Settlement counts for one consumer run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConsumerSummary {
    /// Jobs settled as completed.
    pub resolved: usize,
    /// Jobs settled as failed.
    pub rejected: usize,
    /// Jobs whose settlement the queue refused or failed to record.
    pub unsettled: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum JobEnd {
    Resolved,
    Rejected,
    Unsettled,
}

impl ConsumerSummary {
    fn record(&mut self, end: JobEnd) {
        match end {
            JobEnd::Resolved => self.resolved += 1,
            JobEnd::Rejected => self.rejected += 1,
            JobEnd::Unsettled => self.unsettled += 1,
        }
    }
}

/// Leases jobs from a [`WorkQueue`] and runs at most
/// `ConsumerConfig::max_jobs` of them at once.
#[derive(Debug)]
pub struct Consumer<Q: WorkQueue> {
    queue: Arc<Q>,
    processor: Arc<JobProcessor>,
    config: ConsumerConfig,
}

impl<Q: WorkQueue> Consumer<Q> {
    /// Consumer over `queue`, running jobs through `processor`.
    pub fn new(
        queue: Arc<Q>,
        processor: Arc<JobProcessor>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    /// Consumes jobs until `shutdown` fires or the queue closes, then waits
    /// for every in-flight job to settle.
    pub async fn run(self, shutdown: CancellationToken) -> ConsumerSummary {
        let max_jobs = self.config.max_jobs.max(1);
        let slots = Arc::new(Semaphore::new(max_jobs));
        let renew_every = self.config.lock_renew_interval.max(MIN_TICK);
        let mut jobs = JoinSet::new();
        let mut summary = ConsumerSummary::default();

        let sweeper_stop = shutdown.child_token();
        let sweeper = self.config.stalled_interval.map(|every| {
            tokio::spawn(sweep_stalled(
                Arc::clone(&self.queue),
                every.max(MIN_TICK),
                sweeper_stop.clone(),
            ))
        });

        info!(max_jobs, "consumer started");

        loop {
            while let Some(finished) = jobs.try_join_next() {
                reap(finished, &mut summary);
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Not raced against shutdown: a dequeue that already took a job
            // must hand it over, or the job sits locked until it stalls.
            match self.queue.dequeue(self.config.poll_wait).await {
                Ok(Some(lease)) => {
                    let span = info_span!("job", job_id = %lease.job.id);
                    jobs.spawn(
                        run_job(
                            Arc::clone(&self.queue),
                            Arc::clone(&self.processor),
                            lease,
                            renew_every,
                            permit,
                        )
                        .instrument(span),
                    );
                }
                Ok(None) => trace!("no job available"),
                Err(QueueError::Closed) => {
                    info!("queue closed; consumer stopping");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "dequeue failed; backing off");
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        if !jobs.is_empty() {
            info!(in_flight = jobs.len(), "waiting for in-flight jobs to settle");
        }
        while let Some(finished) = jobs.join_next().await {
            reap(finished, &mut summary);
        }

        sweeper_stop.cancel();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        info!(
            resolved = summary.resolved,
            rejected = summary.rejected,
            unsettled = summary.unsettled,
            "consumer stopped"
        );
        summary
    }
}

fn reap(finished: Result<JobEnd, JoinError>, summary: &mut ConsumerSummary) {
    match finished {
        Ok(end) => summary.record(end),
        Err(err) => {
            error!(error = %err, "job task ended without settling");
            summary.record(JobEnd::Unsettled);
        }
    }
}

/// Processes one leased job and settles it. Holds `_slot` until the
/// settlement has been sent.
async fn run_job<Q: WorkQueue>(
    queue: Arc<Q>,
    processor: Arc<JobProcessor>,
    lease: JobLease,
    renew_every: Duration,
    _slot: OwnedSemaphorePermit,
) -> JobEnd {
    debug!("job started");

    let renewing = CancellationToken::new();
    let renewer = tokio::spawn(
        renew_lock(
            Arc::clone(&queue),
            lease.clone(),
            renew_every,
            renewing.clone(),
        )
        .in_current_span(),
    );

    // Own task, so a panic in this job unwinds only here.
    let job = lease.job.clone();
    let work = tokio::spawn(
        async move { processor.process(&job).await }.in_current_span(),
    );
    let outcome = match work.await {
        Ok(outcome) => outcome,
        Err(err) => Err(JobError::Aborted(join_failure(err))),
    };

    renewing.cancel();
    let _ = renewer.await;

    let settled = match &outcome {
        Ok(report) => queue.resolve(&lease, report).await,
        Err(err) => {
            warn!(phase = err.phase(), error = %err, "job rejected");
            queue.reject(&lease, &err.to_string()).await
        }
    };

    match (settled, outcome.is_ok()) {
        (Ok(()), true) => {
            info!("job resolved");
            JobEnd::Resolved
        }
        (Ok(()), false) => JobEnd::Rejected,
        (Err(err), _) => {
            error!(error = %err, "failed to settle job");
            JobEnd::Unsettled
        }
    }
}

fn join_failure(err: JoinError) -> String {
    if err.is_cancelled() {
        return "job task was cancelled".to_string();
    }
    let payload = err.into_panic();
    format!("job task panicked: {}", panic_text(payload.as_ref()))
}

fn panic_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.as_str()
    } else {
        "non-string panic payload"
    }
}

async fn renew_lock<Q: WorkQueue>(
    queue: Arc<Q>,
    lease: JobLease,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match queue.extend_lock(&lease).await {
            Ok(true) => trace!("job lock extended"),
            Ok(false) => {
                warn!("job lock lost; another worker may pick this job up");
                return;
            }
            Err(err) => warn!(error = %err, "failed to extend job lock"),
        }
    }
}

async fn sweep_stalled<Q: WorkQueue>(
    queue: Arc<Q>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match queue.recover_stalled().await {
            Ok(sweep) => trace!(
                requeued = sweep.requeued,
                failed = sweep.failed,
                "stalled sweep finished"
            ),
            Err(err) => warn!(error = %err, "stalled sweep failed"),
        }
    }
}
