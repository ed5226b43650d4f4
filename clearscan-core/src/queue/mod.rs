//! Work queue abstraction.
//!
//! A queue hands out [`JobLease`]s and accepts exactly one settlement per
//! lease. Redelivery and retry policy belong to the backend, never to the
//! consumer.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::{MemoryQueue, Settlement};
#[cfg(feature = "redis")]
pub use self::redis::{QueueKeys, RedisQueue, RedisQueueConfig};

use async_trait::async_trait;
use std::{fmt, time::Duration};
use thiserror::Error;

use crate::job::{JobId, JobLease, ScanReport};

/// Result alias for queue operations.
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Queue backend failures.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The Redis backend failed.
    #[cfg(feature = "redis")]
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// The job was re-leased elsewhere; its settlement was refused.
    #[error("lock for job {0} is no longer held by this worker")]
    LockLost(JobId),

    /// A settlement value could not be serialised.
    #[error("failed to encode queue value: {0}")]
    Encode(#[from] serde_json::Error),

    /// No more jobs will be handed out.
    #[error("queue is closed")]
    Closed,
}

/// Result of one stalled-job sweep.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StalledSweep {
    /// Jobs moved back to the wait list for redelivery.
    pub requeued: usize,
    /// Jobs failed because they stalled too often.
    pub failed: usize,
}

/// Source of jobs and sink for their settlements.
#[async_trait]
pub trait WorkQueue: Send + Sync + fmt::Debug + 'static {
    /// Takes the next job, waiting up to `wait` for one to arrive.
    ///
    /// `Ok(None)` means nothing was available in time. Implementations must
    /// not lose a job when the returned future is dropped after it resolved.
    async fn dequeue(&self, wait: Duration) -> QueueResult<Option<JobLease>>;

    /// Keeps the lease alive while the job is processing. Returns `false`
    /// once the lease has been lost to another worker.
    async fn extend_lock(&self, _lease: &JobLease) -> QueueResult<bool> {
        Ok(true)
    }

    /// Marks the job completed with `report` as its result.
    async fn resolve(
        &self,
        lease: &JobLease,
        report: &ScanReport,
    ) -> QueueResult<()>;

    /// Marks the job failed with `reason`.
    async fn reject(&self, lease: &JobLease, reason: &str) -> QueueResult<()>;

    /// Returns jobs abandoned by crashed workers to the queue.
    async fn recover_stalled(&self) -> QueueResult<StalledSweep> {
        Ok(StalledSweep::default())
    }
}
