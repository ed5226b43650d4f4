//! Entry point of a single worker process.

use std::{io, path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};

use clearscan_core::{
    Consumer, ConsumerSummary, JobProcessor, QueueError, StorageError,
    queue::RedisQueue,
};

use crate::config::Config;

/// Exit code of a worker that could not start (`EX_CONFIG`). The cluster
/// supervisor treats it as fatal instead of restarting the slot.
pub const EXIT_FATAL_STARTUP: i32 = 78;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to set up object storage: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to prepare scratch directory {}: {source}", path.display())]
    ScratchDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to the work queue: {0}")]
    Queue(#[from] QueueError),
}

/// Wires the dependencies of one worker process and consumes jobs until
/// `shutdown` fires. Everything that can fail does so before the first
/// dequeue.
pub async fn run(
    config: &Config,
    slot: usize,
    shutdown: CancellationToken,
) -> Result<ConsumerSummary, StartupError> {
    let span = info_span!("worker", slot);
    async move {
        let store = config.object_store()?;

        let scratch_dir = &config.worker.scratch_dir;
        tokio::fs::create_dir_all(scratch_dir).await.map_err(|source| {
            StartupError::ScratchDir {
                path: scratch_dir.clone(),
                source,
            }
        })?;

        let queue = Arc::new(RedisQueue::connect(config.redis_queue()).await?);
        let processor = Arc::new(JobProcessor::new(config.processor(), store));

        info!(
            pid = std::process::id(),
            queue = %config.queue.name,
            max_jobs = config.worker.max_jobs,
            storage = config.storage.backend.label(),
            scratch_dir = %scratch_dir.display(),
            "worker ready"
        );

        Ok(Consumer::new(queue, processor, config.consumer())
            .run(shutdown)
            .await)
    }
    .instrument(span)
    .await
}
