use std::time::Duration;

use super::models::{Config, StorageBackend};

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

/// Non-fatal observations about a composed configuration.
pub fn review(config: &Config, cpu_count: usize) -> ConfigWarnings {
    let mut warnings = ConfigWarnings::default();

    if config.worker.processes > cpu_count {
        warnings.push_with_hint(
            format!(
                "WORKER_PROCESSES={} exceeds the {cpu_count} available CPUs",
                config.worker.processes
            ),
            "Scans are CPU bound; extra processes mostly add contention",
        );
    }

    if config.scanner.timeout.is_none() {
        warnings.push_with_hint(
            "No scan timeout configured; a hung scanner holds its job slot forever",
            "Set SCAN_TIMEOUT (e.g. 30m) to bound each scan",
        );
    }

    if config.queue.lock_duration < Duration::from_secs(5) {
        warnings.push(format!(
            "SCAN_LOCK_DURATION of {:?} is very short; a stalled event loop may lose job locks",
            config.queue.lock_duration
        ));
    }

    if let StorageBackend::Filesystem { root } = &config.storage.backend {
        warnings.push_with_hint(
            format!("Using local directory {} as object storage", root.display()),
            "Unset STORAGE_FS_ROOT and configure STORAGE_ENDPOINT for S3",
        );
    }

    warnings
}
