//! Layered configuration: `.env`, then an optional TOML file, then process
//! environment, then defaults.

pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    Config, ConfigMetadata, QueueConfig, StorageBackend, StorageConfig,
    WorkerConfig,
};
pub use validation::{ConfigWarning, ConfigWarnings};
