use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::Notify;
use tracing::debug;

use super::{QueueError, QueueResult, WorkQueue};
use crate::job::{Job, JobId, JobLease, LeaseToken, ScanReport};

/// How a job left the queue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Settlement {
    /// Completed with a report.
    Resolved {
        /// Settled job.
        id: JobId,
        /// Value it resolved with.
        report: ScanReport,
    },
    /// Failed with a reason.
    Rejected {
        /// Settled job.
        id: JobId,
        /// Failure reason it was rejected with.
        reason: String,
    },
}

impl Settlement {
    /// Id of the settled job.
    pub fn id(&self) -> &JobId {
        match self {
            Settlement::Resolved { id, .. } | Settlement::Rejected { id, .. } => id,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Job>,
    active: HashMap<JobId, LeaseToken>,
    peak_active: usize,
    settled: Vec<Settlement>,
    closed: bool,
}

/// In-process queue with the same lease semantics as the Redis backend.
///
/// Records every settlement and the highest number of jobs that were
/// leased at the same time.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    available: Notify,
    settled: Notify,
}

impl MemoryQueue {
    /// Empty, open queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `job` and wakes one waiting consumer.
    pub fn push(&self, job: Job) {
        self.state().pending.push_back(job);
        self.available.notify_one();
    }

    /// Stops handing out jobs. Pending jobs stay queued; `dequeue` fails
    /// with [`QueueError::Closed`] once nothing is left.
    pub fn close(&self) {
        self.state().closed = true;
        self.available.notify_waiters();
    }

    /// Jobs not yet handed out.
    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }

    /// Jobs leased and not yet settled.
    pub fn active(&self) -> usize {
        self.state().active.len()
    }

    /// Highest number of simultaneously leased jobs seen so far.
    pub fn peak_active(&self) -> usize {
        self.state().peak_active
    }

    /// Every settlement so far, in order.
    pub fn settlements(&self) -> Vec<Settlement> {
        self.state().settled.clone()
    }

    /// The settlement of `id`, if it has settled.
    pub fn settlement(&self, id: &JobId) -> Option<Settlement> {
        self.state()
            .settled
            .iter()
            .find(|settlement| settlement.id() == id)
            .cloned()
    }

    /// Waits until at least `count` jobs have settled.
    pub async fn wait_for_settled(&self, count: usize) -> Vec<Settlement> {
        loop {
            let notified = self.settled.notified();
            {
                let state = self.state();
                if state.settled.len() >= count {
                    return state.settled.clone();
                }
            }
            notified.await;
        }
    }

    fn take_next(&self) -> QueueResult<Option<JobLease>> {
        let mut state = self.state();
        let Some(job) = state.pending.pop_front() else {
            return if state.closed {
                Err(QueueError::Closed)
            } else {
                Ok(None)
            };
        };
        let lease = JobLease::new(job);
        state.active.insert(lease.job.id.clone(), lease.token);
        state.peak_active = state.peak_active.max(state.active.len());
        Ok(Some(lease))
    }

    fn settle(&self, lease: &JobLease, settlement: Settlement) -> QueueResult<()> {
        {
            let mut state = self.state();
            match state.active.get(&lease.job.id) {
                Some(token) if *token == lease.token => {}
                _ => return Err(QueueError::LockLost(lease.job.id.clone())),
            }
            state.active.remove(&lease.job.id);
            debug!(job_id = %lease.job.id, "job settled");
            state.settled.push(settlement);
        }
        self.settled.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn dequeue(&self, wait: Duration) -> QueueResult<Option<JobLease>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.available.notified();
            if let Some(lease) = self.take_next()? {
                return Ok(Some(lease));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take_next();
            }
        }
    }

    async fn extend_lock(&self, lease: &JobLease) -> QueueResult<bool> {
        Ok(self.state().active.get(&lease.job.id) == Some(&lease.token))
    }

    async fn resolve(
        &self,
        lease: &JobLease,
        report: &ScanReport,
    ) -> QueueResult<()> {
        self.settle(
            lease,
            Settlement::Resolved {
                id: lease.job.id.clone(),
                report: report.clone(),
            },
        )
    }

    async fn reject(&self, lease: &JobLease, reason: &str) -> QueueResult<()> {
        self.settle(
            lease,
            Settlement::Rejected {
                id: lease.job.id.clone(),
                reason: reason.to_string(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn leases_jobs_in_fifo_order() {
        let queue = MemoryQueue::new();
        queue.push(Job::new("1", vec![]));
        queue.push(Job::new("2", vec![]));

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.job.id.as_str(), "1");
        assert_eq!(second.job.id.as_str(), "2");
        assert_eq!(queue.peak_active(), 2);
        assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_wakes_on_push() {
        let queue = std::sync::Arc::new(MemoryQueue::new());
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(Job::new("late", vec![]));
        });

        let lease = queue.dequeue(Duration::from_secs(5)).await.unwrap();
        assert_eq!(lease.unwrap().job.id.as_str(), "late");
    }

    #[tokio::test]
    async fn settles_once_per_lease() {
        let queue = MemoryQueue::new();
        queue.push(Job::new("1", vec![]));
        let lease = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();

        assert!(queue.extend_lock(&lease).await.unwrap());
        queue.reject(&lease, "boom").await.unwrap();
        assert!(!queue.extend_lock(&lease).await.unwrap());
        assert!(matches!(
            queue.resolve(&lease, &ScanReport::new("{}")).await,
            Err(QueueError::LockLost(_))
        ));

        assert_eq!(
            queue.settlements(),
            vec![Settlement::Rejected {
                id: JobId::new("1"),
                reason: "boom".to_string(),
            }]
        );
        assert_eq!(queue.active(), 0);
    }

    #[tokio::test]
    async fn closed_queue_drains_then_errors() {
        let queue = MemoryQueue::new();
        queue.push(Job::new("1", vec![]));
        queue.close();

        assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_some());
        assert!(matches!(
            queue.dequeue(Duration::ZERO).await,
            Err(QueueError::Closed)
        ));
    }
}
