use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use deltaguard_core::JobEventHub;
use deltaguard_core::progress_log::ProgressLog;
use deltaguard_core::store::{JobStore, MemoryJobStore, PostgresJobStore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::infra::config::Config;
use crate::infra::scan_tracker::ScanTracker;

/// Rows inspected per dispatch tick.
const DISPATCH_SCAN_LIMIT: usize = 50;

/// Picks the job store: Postgres when a database URL is configured,
/// in-memory otherwise.
pub async fn build_store(config: &Config) -> Result<Arc<dyn JobStore>> {
    let Some(url) = config.database.url.as_deref() else {
        warn!("DATABASE_URL not set - jobs are kept in memory and lost on restart");
        return Ok(Arc::new(MemoryJobStore::new()));
    };

    if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
        anyhow::bail!("Invalid database URL: must start with postgres:// or postgresql://");
    }

    let store = PostgresJobStore::connect(url, config.database.max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    store
        .ensure_schema()
        .await
        .context("failed to initialize job schema")?;
    info!("Successfully connected to PostgreSQL");
    Ok(Arc::new(store))
}

pub async fn build_hub(config: &Config) -> Result<Arc<JobEventHub>> {
    let store = build_store(config).await?;
    let log = Arc::new(ProgressLog::new(&config.progress_dir));
    log.ensure_dir().await.with_context(|| {
        format!(
            "failed to create progress directory {}",
            config.progress_dir.display()
        )
    })?;
    info!(
        progress.dir = %config.progress_dir.display(),
        scanner.mode = %config.runner.mode,
        scanner.program = %config.runner.program.display(),
        "job hub configured"
    );
    Ok(Arc::new(JobEventHub::new(store, log, config.hub_config())))
}

/// Periodically starts queued jobs until `shutdown` fires. Started scans are
/// handed to `scans`.
pub fn spawn_dispatcher(
    hub: Arc<JobEventHub>,
    scans: ScanTracker,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match hub.runner().dispatch_queued(DISPATCH_SCAN_LIMIT).await {
                Ok(started) => {
                    if !started.is_empty() {
                        info!(count = started.len(), "dispatched queued jobs");
                    }
                    for handle in started {
                        scans.track(handle);
                    }
                }
                Err(err) => warn!(error = %err, "queued job dispatch failed"),
            }
        }
        debug!("job dispatcher stopped");
    })
}
