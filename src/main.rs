//! stratumd
//!
//! Hosts the storage engine, the reaper and the operation engine. On start
//! it resumes operations interrupted by a previous exit; on Ctrl-C it stops
//! running operations so the next start resumes them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use stratum::core::config::Config;
use stratum::core::paths::DatasetPaths;
use stratum::ops::{FileStore, OperationEngine};
use stratum::remote::RemoteRegistry;
use stratum::storage::exec::ProcessExecutor;
use stratum::storage::zfs::ZfsBackend;
use stratum::storage::{Reaper, StorageEngine};
use stratum::telemetry;

#[derive(Parser, Debug)]
#[command(name = "stratumd")]
#[command(about = "Version control for data volumes")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration, print the resolved settings and exit
    #[arg(long)]
    check_config: bool,
}

fn print_config(config: &Config) {
    println!("configuration ok");
    match config.path() {
        Some(path) => println!("source: {}", path.display()),
        None => println!("source: defaults"),
    }
    println!("pool: {}", config.pool());
    println!("mount_root: {}", config.mount_root().display());
    println!("metadata_dir: {}", config.metadata_dir().display());
    println!("command_timeout_secs: {}", config.command_timeout().as_secs());
    println!("reaper_interval_secs: {}", config.reaper_interval().as_secs());
    println!("log_filter: {}", config.log().filter());
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    if args.check_config {
        telemetry::env_filter(&config.log())?;
        print_config(&config);
        return Ok(());
    }

    telemetry::init(&config.log())?;
    info!(pool = %config.pool(), "starting stratumd");

    let backend = ZfsBackend::new(ProcessExecutor::with_timeout(config.command_timeout()));
    let storage = StorageEngine::new(
        Arc::new(backend),
        DatasetPaths::new(config.pool(), config.mount_root()),
    );
    let init = storage.clone();
    tokio::task::spawn_blocking(move || init.initialize())
        .await
        .context("storage initialization panicked")??;

    let store = FileStore::open(&config.metadata_dir())
        .with_context(|| {
            format!("cannot open metadata store {}", config.metadata_dir().display())
        })?;

    let reaper = Reaper::new(storage.clone(), config.reaper_interval());
    let reaper_task = reaper.spawn();

    let engine = OperationEngine::new(
        storage,
        RemoteRegistry::with_defaults(),
        Arc::new(store),
        Some(reaper.clone()),
    );
    let resumed = engine.load_state().await?;
    info!(resumed, "stratumd ready");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    engine.shutdown().await;
    reaper.stop();
    reaper_task.await.ok();

    info!("stratumd stopped");
    Ok(())
}
