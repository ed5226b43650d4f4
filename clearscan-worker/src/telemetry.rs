use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ConfigLoad, ConfigWarnings};

/// Installs the global subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Logs how configuration was assembled. Only called after the subscriber
/// is installed so nothing is lost.
pub fn report_config(load: &ConfigLoad) {
    let metadata = &load.config.metadata;
    if metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    log_warnings(&load.warnings);
}

pub fn log_warnings(warnings: &ConfigWarnings) {
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(hint = %hint, "{}", warning.message),
            None => warn!("{}", warning.message),
        }
    }
}
