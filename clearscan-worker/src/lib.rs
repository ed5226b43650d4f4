//! # Clearscan Worker
//!
//! Process-level half of the scan worker: configuration, logging, the
//! cluster supervisor and the per-process entry point. The job pipeline
//! itself lives in `clearscan-core`.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod shutdown;
pub mod telemetry;
pub mod worker;
