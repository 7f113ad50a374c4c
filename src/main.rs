use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use batch_supervisor::config::SupervisorConfig;
use batch_supervisor::process::reaper::OrphanReaper;
use batch_supervisor::registry::JobRegistry;
use batch_supervisor::schedule::{JobScheduler, spawn_schedule_ticker};
use batch_supervisor::storage::LocalStorage;
use batch_supervisor::store::{JobStore, LibSqlStore};
use batch_supervisor::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; SUPERVISOR_LOG_DIR adds a daily rolling file.
    let file_layer = std::env::var("SUPERVISOR_LOG_DIR").ok().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "batch-supervisor.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(writer);
        (layer, guard)
    });
    let (file_layer, _log_guard) = match file_layer {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    let config = Arc::new(SupervisorConfig::from_env().context("invalid configuration")?);
    tracing::info!(
        worker = %config.worker_program,
        scratch_root = %config.scratch_root.display(),
        max_parallel_jobs = config.max_parallel_jobs,
        "Starting batch supervisor"
    );

    let store = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .context("failed to open job database")?,
    );
    let reset = store.reset_interrupted_jobs().await?;
    if reset > 0 {
        tracing::warn!(count = reset, "Marked jobs interrupted by the last shutdown as errored");
    }

    // Nothing is running yet, so every matching process or scratch dir is stale.
    let reaper = OrphanReaper::new(config.orphan_regex()?, &config.scratch_root);
    let report = reaper.reap_startup().await;
    if !report.is_empty() {
        tracing::info!(
            killed = report.killed.len(),
            removed_dirs = report.removed_dirs.len(),
            "Cleaned up after previous run"
        );
    }

    let storage = Arc::new(LocalStorage::new(&config.storage_root));
    let supervisor = Arc::new(Supervisor::new(Arc::clone(&config), store.clone(), storage));
    let registry = Arc::new(JobRegistry::new(supervisor, store.clone()));
    let scheduler = Arc::new(JobScheduler::new(store.clone(), Arc::clone(&registry)));
    let ticker = spawn_schedule_ticker(scheduler, config.schedule_interval);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    ticker.abort();
    registry.stop_all().await;
    tracing::info!("Batch supervisor stopped");
    Ok(())
}
