use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub queue: FileQueueConfig,
    #[serde(default)]
    pub worker: FileWorkerConfig,
    #[serde(default)]
    pub scanner: FileScannerConfig,
    #[serde(default)]
    pub storage: FileStorageConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileQueueConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Human readable duration, e.g. `"30s"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stalled_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_stalled_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileWorkerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_jobs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_concurrency: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileScannerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_report_bytes: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileStorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_root: Option<PathBuf>,
}

/// Environment-derived configuration values.
///
/// Values are kept as raw strings; parsing happens while composing so a
/// malformed variable is reported instead of silently ignored.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub queue_name: Option<String>,
    pub queue_prefix: Option<String>,
    pub lock_duration: Option<String>,
    pub stalled_interval: Option<String>,
    pub max_stalled_count: Option<String>,
    pub poll_interval: Option<String>,
    pub processes: Option<String>,
    pub max_jobs: Option<String>,
    pub scratch_dir: Option<PathBuf>,
    pub download_concurrency: Option<String>,
    pub scanner_program: Option<PathBuf>,
    pub scan_timeout: Option<String>,
    pub exit_policy: Option<String>,
    pub max_report_bytes: Option<String>,
    pub storage_bucket: Option<String>,
    pub storage_endpoint: Option<String>,
    pub storage_region: Option<String>,
    pub storage_access_key_id: Option<String>,
    pub storage_secret_access_key: Option<String>,
    pub storage_fs_root: Option<PathBuf>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: var("CLEARSCAN_CONFIG").map(PathBuf::from),
            redis_url: var("REDIS_URL"),
            queue_name: var("SCAN_QUEUE_NAME"),
            queue_prefix: var("SCAN_QUEUE_PREFIX"),
            lock_duration: var("SCAN_LOCK_DURATION"),
            stalled_interval: var("SCAN_STALLED_INTERVAL"),
            max_stalled_count: var("SCAN_MAX_STALLED_COUNT"),
            poll_interval: var("SCAN_POLL_INTERVAL"),
            processes: var("WORKER_PROCESSES"),
            max_jobs: var("MAX_JOBS_PER_WORKER"),
            scratch_dir: var("SCRATCH_DIR").map(PathBuf::from),
            download_concurrency: var("STAGING_CONCURRENCY"),
            scanner_program: var("SCANCODE_PATH").map(PathBuf::from),
            scan_timeout: var("SCAN_TIMEOUT"),
            exit_policy: var("SCAN_EXIT_POLICY"),
            max_report_bytes: var("SCAN_MAX_REPORT_BYTES"),
            storage_bucket: var("STORAGE_BUCKET"),
            storage_endpoint: var("STORAGE_ENDPOINT"),
            storage_region: var("STORAGE_REGION"),
            storage_access_key_id: var("STORAGE_ACCESS_KEY_ID"),
            storage_secret_access_key: var("STORAGE_SECRET_ACCESS_KEY"),
            storage_fs_root: var("STORAGE_FS_ROOT").map(PathBuf::from),
        }
    }
}

/// Reads a variable, treating blank values as unset.
fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}
