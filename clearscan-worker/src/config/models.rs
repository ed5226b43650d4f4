use std::{path::PathBuf, sync::Arc, time::Duration};

use clearscan_core::{
    ConsumerConfig, ObjectStore, ProcessorConfig, ScannerConfig,
    queue::RedisQueueConfig,
    storage::{FsObjectStore, S3Config, S3Credentials, S3ObjectStore, StorageResult},
};
use url::Url;

const S3_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub scanner: ScannerConfig,
    pub storage: StorageConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub redis_url: String,
    pub name: String,
    pub prefix: String,
    pub lock_duration: Duration,
    pub stalled_interval: Duration,
    pub max_stalled_count: u32,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker processes in the cluster.
    pub processes: usize,
    /// In-flight jobs per worker process.
    pub max_jobs: usize,
    pub scratch_dir: PathBuf,
    pub download_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub backend: StorageBackend,
}

#[derive(Debug, Clone)]
pub enum StorageBackend {
    S3 {
        endpoint: Url,
        region: String,
        credentials: S3Credentials,
    },
    Filesystem {
        root: PathBuf,
    },
}

impl StorageBackend {
    pub fn label(&self) -> &'static str {
        match self {
            StorageBackend::S3 { .. } => "s3",
            StorageBackend::Filesystem { .. } => "filesystem",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

impl Config {
    pub fn redis_queue(&self) -> RedisQueueConfig {
        RedisQueueConfig {
            url: self.queue.redis_url.clone(),
            name: self.queue.name.clone(),
            prefix: self.queue.prefix.clone(),
            lock_duration: self.queue.lock_duration,
            max_stalled_count: self.queue.max_stalled_count,
            poll_interval: self.queue.poll_interval,
        }
    }

    pub fn processor(&self) -> ProcessorConfig {
        ProcessorConfig {
            scratch_dir: self.worker.scratch_dir.clone(),
            bucket: self.storage.bucket.clone(),
            download_concurrency: self.worker.download_concurrency,
            scanner: self.scanner.clone(),
        }
    }

    /// Locks are renewed at half their lifetime.
    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            max_jobs: self.worker.max_jobs,
            poll_wait: Duration::from_secs(1).max(self.queue.poll_interval),
            lock_renew_interval: self.queue.lock_duration / 2,
            stalled_interval: Some(self.queue.stalled_interval),
            error_backoff: Duration::from_secs(1),
        }
    }

    pub fn object_store(&self) -> StorageResult<Arc<dyn ObjectStore>> {
        Ok(match &self.storage.backend {
            StorageBackend::S3 {
                endpoint,
                region,
                credentials,
            } => Arc::new(S3ObjectStore::new(S3Config {
                endpoint: endpoint.clone(),
                region: region.clone(),
                credentials: credentials.clone(),
                request_timeout: S3_REQUEST_TIMEOUT,
            })?),
            StorageBackend::Filesystem { root } => {
                Arc::new(FsObjectStore::new(root.clone()))
            }
        })
    }
}
