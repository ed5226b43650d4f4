//! Core of the clearscan worker: everything that happens to a job between
//! the queue handing it out and the queue receiving its settlement.
//!
//! - [`storage`]: blob download/upload against S3 or a local directory.
//! - [`workspace`] and [`staging`]: the per-job scratch directory and
//!   materialising job files into it.
//! - [`scan`]: running the scanning tool and collecting its output.
//! - [`processor`]: one job end to end, cleanup included.
//! - [`queue`] and [`consumer`]: leasing jobs with bounded concurrency and
//!   settling them.

pub mod consumer;
pub mod error;
pub mod job;
pub mod processor;
pub mod queue;
pub mod scan;
pub mod staging;
pub mod storage;
pub mod workspace;

pub use consumer::{Consumer, ConsumerConfig, ConsumerSummary};
pub use error::JobError;
pub use job::{Job, JobFile, JobId, JobLease, JobPayload, LeaseToken, ScanReport};
pub use processor::{JobProcessor, ProcessorConfig};
pub use queue::{MemoryQueue, QueueError, Settlement, StalledSweep, WorkQueue};
pub use scan::{ExitPolicy, ScanError, ScanSupervisor, ScannerConfig};
pub use staging::{Stager, StagingError};
pub use storage::{FsObjectStore, ObjectStore, StorageError};
pub use workspace::{Workspace, WorkspaceError};
