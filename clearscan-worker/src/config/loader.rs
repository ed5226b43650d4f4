use std::{
    fmt::Display,
    fs,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use url::Url;

use clearscan_core::{ExitPolicy, ScannerConfig, storage::S3Credentials};

use super::{
    models::{
        Config, ConfigMetadata, QueueConfig, StorageBackend, StorageConfig,
        WorkerConfig,
    },
    sources::{EnvConfig, FileConfig},
    validation::{self, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] =
    ["clearscan.toml", "config/clearscan.toml"];

const REDIS_SCHEMES: [&str; 4] = ["redis", "rediss", "redis+unix", "unix"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {}", path.display())]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{key} is required: {hint}")]
    MissingValue { key: &'static str, hint: &'static str },
    #[error("invalid {key} '{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

impl ConfigLoadError {
    fn invalid(key: &'static str, value: impl Display, reason: impl Display) -> Self {
        ConfigLoadError::InvalidValue {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let env_config = EnvConfig::gather();
        let (file_config, config_path) = self.load_file_config(&env_config)?;

        let (config, warnings) = compose_config(
            file_config,
            env_config,
            ConfigMetadata {
                config_path,
                env_file_loaded,
            },
            num_cpus::get(),
        )?;

        Ok(ConfigLoad { config, warnings })
    }

    /// An explicitly named file must exist; the default locations are only
    /// used when present.
    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env_config.config_path.clone());

        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigLoadError::MissingConfig { path });
                }
                path
            }
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => path,
                None => return Ok((None, None)),
            },
        };

        let contents =
            fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
                path: path.clone(),
                source,
            })?;
        let file_config = parse_file_config(&contents).map_err(|source| {
            ConfigLoadError::Parse {
                path: path.clone(),
                source,
            }
        })?;

        Ok((Some(file_config), Some(path)))
    }
}

pub fn parse_file_config(contents: &str) -> Result<FileConfig, toml::de::Error> {
    toml::from_str(contents)
}

/// Merges file values, environment overrides and defaults into a validated
/// [`Config`]. Environment values win over file values.
pub fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    metadata: ConfigMetadata,
    cpu_count: usize,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if file_config.is_none() {
        warnings.push_with_hint(
            "No clearscan.toml detected; using environment variables and defaults",
            "Pass --config or set CLEARSCAN_CONFIG to load a configuration file",
        );
    }

    let FileConfig {
        queue: file_queue,
        worker: file_worker,
        scanner: file_scanner,
        storage: file_storage,
    } = file_config.unwrap_or_default();

    let redis_url = env
        .redis_url
        .or(file_queue.redis_url)
        .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());
    validate_redis_url(&redis_url)?;

    let queue = QueueConfig {
        redis_url,
        name: env
            .queue_name
            .or(file_queue.name)
            .unwrap_or_else(|| "scan".to_string()),
        prefix: env
            .queue_prefix
            .or(file_queue.prefix)
            .unwrap_or_else(|| "bull".to_string()),
        lock_duration: non_zero_duration(
            "SCAN_LOCK_DURATION",
            env.lock_duration.or(file_queue.lock_duration),
            Duration::from_secs(30),
        )?,
        stalled_interval: non_zero_duration(
            "SCAN_STALLED_INTERVAL",
            env.stalled_interval.or(file_queue.stalled_interval),
            Duration::from_secs(30),
        )?,
        max_stalled_count: number(
            "SCAN_MAX_STALLED_COUNT",
            env.max_stalled_count.as_deref(),
            file_queue.max_stalled_count,
            1,
        )?,
        poll_interval: non_zero_duration(
            "SCAN_POLL_INTERVAL",
            env.poll_interval.or(file_queue.poll_interval),
            Duration::from_millis(500),
        )?,
    };

    let worker = WorkerConfig {
        processes: positive(
            "WORKER_PROCESSES",
            env.processes.as_deref(),
            file_worker.processes,
            cpu_count.max(1),
        )?,
        max_jobs: positive(
            "MAX_JOBS_PER_WORKER",
            env.max_jobs.as_deref(),
            file_worker.max_jobs,
            1,
        )?,
        scratch_dir: env
            .scratch_dir
            .or(file_worker.scratch_dir)
            .unwrap_or_else(|| std::env::temp_dir().join("clearscan")),
        download_concurrency: positive(
            "STAGING_CONCURRENCY",
            env.download_concurrency.as_deref(),
            file_worker.download_concurrency,
            4,
        )?,
    };

    let defaults = ScannerConfig::default();
    let exit_policy = match env.exit_policy.or(file_scanner.exit_policy) {
        Some(raw) => raw.parse::<ExitPolicy>().map_err(|reason| {
            ConfigLoadError::invalid("SCAN_EXIT_POLICY", &raw, reason)
        })?,
        None => ExitPolicy::default(),
    };
    let scanner = ScannerConfig {
        program: env
            .scanner_program
            .or(file_scanner.program)
            .unwrap_or(defaults.program),
        timeout: optional_duration(
            "SCAN_TIMEOUT",
            env.scan_timeout.or(file_scanner.timeout),
        )?,
        exit_policy,
        max_report_bytes: positive(
            "SCAN_MAX_REPORT_BYTES",
            env.max_report_bytes.as_deref(),
            file_scanner.max_report_bytes,
            defaults.max_report_bytes,
        )?,
        max_diagnostic_bytes: defaults.max_diagnostic_bytes,
    };

    let bucket = env.storage_bucket.or(file_storage.bucket).ok_or(
        ConfigLoadError::MissingValue {
            key: "STORAGE_BUCKET",
            hint: "name the bucket holding job blobs",
        },
    )?;
    let backend = match env.storage_fs_root.or(file_storage.fs_root) {
        Some(root) => StorageBackend::Filesystem { root },
        None => {
            let raw_endpoint = env.storage_endpoint.or(file_storage.endpoint).ok_or(
                ConfigLoadError::MissingValue {
                    key: "STORAGE_ENDPOINT",
                    hint: "set the S3 endpoint URL, or STORAGE_FS_ROOT for a local store",
                },
            )?;
            let endpoint = Url::parse(&raw_endpoint).map_err(|err| {
                ConfigLoadError::invalid("STORAGE_ENDPOINT", &raw_endpoint, err)
            })?;
            if !matches!(endpoint.scheme(), "http" | "https") {
                return Err(ConfigLoadError::invalid(
                    "STORAGE_ENDPOINT",
                    &raw_endpoint,
                    "expected an http or https URL",
                ));
            }
            let access_key_id = env
                .storage_access_key_id
                .or(file_storage.access_key_id)
                .ok_or(ConfigLoadError::MissingValue {
                    key: "STORAGE_ACCESS_KEY_ID",
                    hint: "S3 storage needs credentials",
                })?;
            let secret_access_key = env
                .storage_secret_access_key
                .or(file_storage.secret_access_key)
                .ok_or(ConfigLoadError::MissingValue {
                    key: "STORAGE_SECRET_ACCESS_KEY",
                    hint: "S3 storage needs credentials",
                })?;
            StorageBackend::S3 {
                endpoint,
                region: env
                    .storage_region
                    .or(file_storage.region)
                    .unwrap_or_else(|| "us-east-1".to_string()),
                credentials: S3Credentials {
                    access_key_id,
                    secret_access_key,
                },
            }
        }
    };

    let config = Config {
        queue,
        worker,
        scanner,
        storage: StorageConfig { bucket, backend },
        metadata,
    };

    warnings.extend(validation::review(&config, cpu_count));
    Ok((config, warnings))
}

fn validate_redis_url(raw: &str) -> Result<(), ConfigLoadError> {
    let url = Url::parse(raw)
        .map_err(|err| ConfigLoadError::invalid("REDIS_URL", raw, err))?;
    if !REDIS_SCHEMES.contains(&url.scheme()) {
        return Err(ConfigLoadError::invalid(
            "REDIS_URL",
            raw,
            "expected a redis:// or rediss:// URL",
        ));
    }
    Ok(())
}

fn number<T>(
    key: &'static str,
    env: Option<&str>,
    file: Option<T>,
    default: T,
) -> Result<T, ConfigLoadError>
where
    T: FromStr,
    T::Err: Display,
{
    match env {
        Some(raw) => raw
            .parse()
            .map_err(|err| ConfigLoadError::invalid(key, raw, err)),
        None => Ok(file.unwrap_or(default)),
    }
}

fn positive(
    key: &'static str,
    env: Option<&str>,
    file: Option<usize>,
    default: usize,
) -> Result<usize, ConfigLoadError> {
    let value = number(key, env, file, default)?;
    if value == 0 {
        return Err(ConfigLoadError::invalid(key, value, "must be at least 1"));
    }
    Ok(value)
}

fn non_zero_duration(
    key: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    let value = humantime::parse_duration(&raw)
        .map_err(|err| ConfigLoadError::invalid(key, &raw, err))?;
    if value.is_zero() {
        return Err(ConfigLoadError::invalid(key, &raw, "must be greater than zero"));
    }
    Ok(value)
}

/// `none`, `off` and `0` disable the limit.
fn optional_duration(
    key: &'static str,
    raw: Option<String>,
) -> Result<Option<Duration>, ConfigLoadError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if matches!(raw.to_ascii_lowercase().as_str(), "none" | "off" | "0") {
        return Ok(None);
    }
    humantime::parse_duration(&raw)
        .map(Some)
        .map_err(|err| ConfigLoadError::invalid(key, &raw, err))
}
