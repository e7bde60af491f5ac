use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::change_bus::{BusSubscription, ChangeBus, ChangeBusConfig, ChangeHandler};
use crate::error::{CoreError, Result};
use crate::progress_log::ProgressLog;
use crate::runner::{RunnerConfig, ScanHandle, ScanRunner};
use crate::store::JobStore;
use crate::tailer::{ProgressHandler, TailSubscription, TailerConfig, TailerRegistry};
use crate::types::{Job, JobId, NewJob};

pub const DEFAULT_SNAPSHOT_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub snapshot_limit: usize,
    pub bus: ChangeBusConfig,
    pub tailer: TailerConfig,
    pub runner: RunnerConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
            bus: ChangeBusConfig::default(),
            tailer: TailerConfig::default(),
            runner: RunnerConfig::default(),
        }
    }
}

/// Owns the change bus, tailers and runner for one process.
///
/// Built once by the composition root and shared by reference; nothing in the
/// crate looks it up globally.
pub struct JobEventHub {
    store: Arc<dyn JobStore>,
    log: Arc<ProgressLog>,
    bus: ChangeBus,
    tailers: TailerRegistry,
    runner: ScanRunner,
    snapshot_limit: usize,
}

impl JobEventHub {
    pub fn new(store: Arc<dyn JobStore>, log: Arc<ProgressLog>, config: HubConfig) -> Self {
        let bus = ChangeBus::new(Arc::clone(&store), config.bus);
        let tailers = TailerRegistry::new(Arc::clone(&log), config.tailer);
        let runner = ScanRunner::new(Arc::clone(&store), Arc::clone(&log), config.runner);
        Self {
            store,
            log,
            bus,
            tailers,
            runner,
            snapshot_limit: config.snapshot_limit,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn log(&self) -> &ProgressLog {
        &self.log
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub fn tailers(&self) -> &TailerRegistry {
        &self.tailers
    }

    pub fn runner(&self) -> &ScanRunner {
        &self.runner
    }

    pub fn snapshot_limit(&self) -> usize {
        self.snapshot_limit
    }

    /// Recent jobs for an initial list view: running, then queued, then the
    /// rest, each group newest first.
    pub async fn snapshot(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = self.store.list(limit).await?;
        jobs.sort_by_key(|job| (job.status.snapshot_rank(), Reverse(job.created_at)));
        Ok(jobs)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Job> {
        Ok(self.store.get(job_id).await?)
    }

    pub async fn subscribe_jobs(&self, handler: ChangeHandler) -> BusSubscription {
        self.bus.subscribe(handler).await
    }

    pub async fn subscribe_progress(
        &self,
        job_id: JobId,
        handler: ProgressHandler,
    ) -> Result<TailSubscription> {
        self.tailers.subscribe(job_id, handler).await
    }

    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        let job = self.store.create(new).await?;
        info!(job = %job.id, "job created");
        Ok(job)
    }

    pub async fn start_job(&self, job_id: JobId) -> Result<ScanHandle> {
        Ok(self.runner.start(job_id).await?)
    }

    /// Creates a job and starts it immediately. Returns the job as created.
    pub async fn create_and_start(&self, new: NewJob) -> Result<(Job, ScanHandle)> {
        let job = self.create_job(new).await?;
        let handle = self.start_job(job.id).await?;
        Ok((job, handle))
    }

    /// Cancels the job's scan. `Ok(false)` means the job exists but nothing
    /// was running for it.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool> {
        self.store.get(job_id).await?;
        Ok(self.runner.cancel(job_id).await)
    }

    /// Deletes a job with its progress file, stopping its scan and tailer.
    /// A running scanner is reaped before the file goes, so its last writes
    /// cannot recreate it. Returns `false` when the job did not exist.
    pub async fn remove_job(&self, job_id: JobId) -> Result<bool> {
        if self.runner.cancel_and_reap(job_id).await {
            debug!(job = %job_id, "cancelled scan before removal");
        }
        self.tailers.close_job(job_id);
        match self.log.remove(job_id).await {
            Ok(_) => {}
            Err(CoreError::Io(err)) => {
                warn!(job = %job_id, error = %err, "failed to remove progress file");
            }
            Err(err) => return Err(err),
        }
        let removed = self.store.delete(job_id).await?;
        if removed {
            info!(job = %job_id, "job removed");
        }
        Ok(removed)
    }

    /// Cancels running scans and stops background loops.
    pub async fn shutdown(&self) {
        self.runner.shutdown().await;
        self.tailers.shutdown();
        self.bus.shutdown();
    }
}

impl fmt::Debug for JobEventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEventHub")
            .field("bus", &self.bus)
            .field("tailers", &self.tailers)
            .field("runner", &self.runner)
            .field("snapshot_limit", &self.snapshot_limit)
            .finish()
    }
}
