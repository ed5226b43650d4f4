use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::{ffi::OsString, path::PathBuf, process::ExitCode};
use tokio_util::sync::CancellationToken;
use tracing::info;

use clearscan_worker::{
    cluster::{ClusterConfig, ClusterSupervisor},
    commands,
    config::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions},
    shutdown, telemetry,
    worker::{self, EXIT_FATAL_STARTUP, StartupError},
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "clearscan-worker")]
#[command(
    about = "Clustered license-scan worker: pulls jobs from Redis, stages blobs and runs the scanner"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(ClapArgs, Debug, Clone)]
struct GlobalArgs {
    /// TOML configuration file (defaults to ./clearscan.toml when present)
    #[arg(long, global = true, env = "CLEARSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Dotenv file loaded before the environment is read
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the worker cluster (default)
    Run(RunArgs),
    /// Run a single worker process; used by the cluster supervisor
    Worker {
        #[arg(long, default_value_t = 0)]
        slot: usize,
    },
    #[command(subcommand)]
    Config(ConfigCommand),
    #[command(subcommand)]
    Storage(StorageCommand),
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct RunArgs {
    /// Consume jobs in this process instead of forking workers
    #[arg(long, default_value_t = false)]
    inline: bool,

    /// Worker processes (overrides WORKER_PROCESSES)
    #[arg(long)]
    processes: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Load and validate configuration, print a summary and exit
    Check,
}

#[derive(Debug, Subcommand)]
enum StorageCommand {
    /// Download a blob from the configured bucket
    Get { key: String, path: PathBuf },
    /// Upload a local file to the configured bucket
    Put { path: PathBuf, key: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Configuration and startup failures exit with `EX_CONFIG` so the cluster
/// supervisor does not restart a worker that can never come up.
fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigLoadError>().is_some()
        || err.downcast_ref::<StartupError>().is_some()
    {
        EXIT_FATAL_STARTUP as u8
    } else {
        1
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let Cli { global, command } = cli;
    match command.unwrap_or_else(|| Command::Run(RunArgs::default())) {
        Command::Run(args) => run_cluster(&global, args).await,
        Command::Worker { slot } => run_worker(&global, slot).await,
        Command::Config(ConfigCommand::Check) => {
            let load = load_config(&global)?;
            print!("{}", commands::config_summary(&load));
            Ok(())
        }
        Command::Storage(StorageCommand::Get { key, path }) => {
            let load = start(&global)?;
            commands::storage_get(&load.config, &key, &path).await
        }
        Command::Storage(StorageCommand::Put { path, key }) => {
            let load = start(&global)?;
            commands::storage_put(&load.config, &path, &key).await
        }
    }
}

fn load_config(global: &GlobalArgs) -> anyhow::Result<ConfigLoad> {
    let load = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: global.config.clone(),
        env_file: global.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;
    Ok(load)
}

/// Loads configuration, then installs logging so `.env` can set `RUST_LOG`.
fn start(global: &GlobalArgs) -> anyhow::Result<ConfigLoad> {
    let load = load_config(global)?;
    telemetry::init_tracing();
    telemetry::report_config(&load);
    Ok(load)
}

async fn run_worker(global: &GlobalArgs, slot: usize) -> anyhow::Result<()> {
    let load = start(global)?;
    let shutdown = CancellationToken::new();
    let signals = shutdown::cancel_on_signal(shutdown.clone());

    let summary = worker::run(&load.config, slot, shutdown.clone())
        .await
        .context("worker failed to start")?;
    shutdown.cancel();
    let _ = signals.await;

    info!(
        slot,
        resolved = summary.resolved,
        rejected = summary.rejected,
        unsettled = summary.unsettled,
        "worker stopped"
    );
    Ok(())
}

async fn run_cluster(global: &GlobalArgs, args: RunArgs) -> anyhow::Result<()> {
    if args.inline {
        return run_worker(global, 0).await;
    }

    let load = start(global)?;
    let processes = args.processes.unwrap_or(load.config.worker.processes);
    let program = std::env::current_exe()
        .context("failed to locate the worker executable")?;

    let mut cluster = ClusterConfig::new(processes, program);
    cluster.args = forwarded_args(global, &load);

    let shutdown = CancellationToken::new();
    let signals = shutdown::cancel_on_signal(shutdown.clone());
    let result = ClusterSupervisor::new(cluster)
        .run(shutdown.clone())
        .await;
    shutdown.cancel();
    let _ = signals.await;

    result.context("worker cluster failed")
}

/// Workers read the same file the supervisor resolved, even when it was
/// found in a default location.
fn forwarded_args(global: &GlobalArgs, load: &ConfigLoad) -> Vec<OsString> {
    let mut args = Vec::new();
    if let Some(path) = &load.config.metadata.config_path {
        args.push(OsString::from("--config"));
        args.push(path.clone().into_os_string());
    }
    if let Some(path) = &global.env_file {
        args.push(OsString::from("--env-file"));
        args.push(path.clone().into_os_string());
    }
    args
}
