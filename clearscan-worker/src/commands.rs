//! Operator subcommands that don't run the consumer.

use anyhow::{Context, Result};
use std::{fmt::Write as _, path::Path};
use tracing::info;

use crate::config::{Config, ConfigLoad, StorageBackend};

/// Human readable rendering of a loaded configuration, secrets omitted.
pub fn config_summary(load: &ConfigLoad) -> String {
    let config = &load.config;
    let mut out = String::new();

    let source = config
        .metadata
        .config_path
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "environment only".to_string());
    let _ = writeln!(out, "configuration: {source}");
    let _ = writeln!(
        out,
        "queue:         {}:{} at {}",
        config.queue.prefix,
        config.queue.name,
        redact_url(&config.queue.redis_url)
    );
    let _ = writeln!(
        out,
        "cluster:       {} processes x {} jobs",
        config.worker.processes, config.worker.max_jobs
    );
    let _ = writeln!(
        out,
        "scratch:       {}",
        config.worker.scratch_dir.display()
    );
    let timeout = config
        .scanner
        .timeout
        .map(|limit| humantime::format_duration(limit).to_string())
        .unwrap_or_else(|| "none".to_string());
    let _ = writeln!(
        out,
        "scanner:       {} (timeout {timeout}, exit policy {:?})",
        config.scanner.program.display(),
        config.scanner.exit_policy
    );
    let storage = match &config.storage.backend {
        StorageBackend::S3 {
            endpoint, region, ..
        } => format!("s3 {endpoint} ({region})"),
        StorageBackend::Filesystem { root } => {
            format!("directory {}", root.display())
        }
    };
    let _ = writeln!(
        out,
        "storage:       bucket {} via {storage}",
        config.storage.bucket
    );

    if load.warnings.is_empty() {
        let _ = writeln!(out, "no warnings");
    }
    for warning in &load.warnings.items {
        let _ = writeln!(out, "warning: {}", warning.message);
        if let Some(hint) = &warning.hint {
            let _ = writeln!(out, "  hint: {hint}");
        }
    }
    out
}

/// Drops the password from a connection URL before it is printed.
fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

pub async fn storage_get(config: &Config, key: &str, path: &Path) -> Result<()> {
    let store = config.object_store()?;
    let bytes = store
        .download(&config.storage.bucket, key)
        .await
        .with_context(|| format!("failed to download {key}"))?;
    tokio::fs::write(path, &bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(key, path = %path.display(), size = bytes.len(), "blob downloaded");
    Ok(())
}

pub async fn storage_put(config: &Config, path: &Path, key: &str) -> Result<()> {
    let store = config.object_store()?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let size = bytes.len();
    store
        .upload(&config.storage.bucket, key, bytes)
        .await
        .with_context(|| format!("failed to upload {key}"))?;
    info!(key, path = %path.display(), size, "blob uploaded");
    Ok(())
}
