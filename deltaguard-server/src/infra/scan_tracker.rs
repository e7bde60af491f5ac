use std::{fmt, sync::Arc, time::Duration};

use deltaguard_core::runner::{JobOutcome, RunnerError, ScanHandle};
use deltaguard_core::types::JobId;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub type ScanResult = (JobId, Result<JobOutcome, RunnerError>);

/// Supervisor set for scans started by the server.
///
/// Every [`ScanHandle`] is awaited here; its outcome is logged and held until
/// [`drain`](Self::drain) collects it on shutdown.
#[derive(Clone, Default)]
pub struct ScanTracker {
    tasks: Arc<Mutex<JoinSet<ScanResult>>>,
}

impl ScanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, handle: ScanHandle) {
        let mut tasks = self.tasks.lock();
        while let Some(joined) = tasks.try_join_next() {
            if let Err(err) = joined {
                warn!(error = %err, "scan watcher task failed");
            }
        }
        tasks.spawn(watch_scan(handle));
    }

    /// Scans still being watched.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits up to `limit` for every tracked scan, returning the results not
    /// yet collected. Watchers still running after `limit` are aborted.
    pub async fn drain(&self, limit: Duration) -> Vec<ScanResult> {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let mut results = Vec::with_capacity(tasks.len());
        let collected = timeout(limit, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(err) => warn!(error = %err, "scan watcher task failed"),
                }
            }
        })
        .await;
        if collected.is_err() {
            warn!(pending = tasks.len(), "scans still running at shutdown");
            tasks.shutdown().await;
        }
        results
    }
}

async fn watch_scan(handle: ScanHandle) -> ScanResult {
    let job_id = handle.job_id();
    let result = handle.wait().await;
    match &result {
        Ok(JobOutcome::Done { .. }) => debug!(job = %job_id, "scan finished"),
        Ok(JobOutcome::Failed { error }) => info!(job = %job_id, error = %error, "scan failed"),
        Ok(JobOutcome::Cancelled) => debug!(job = %job_id, "scan cancelled"),
        Err(err) => error!(job = %job_id, error = %err, "scan supervisor failed"),
    }
    (job_id, result)
}

impl fmt::Debug for ScanTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanTracker")
            .field("tracked", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use deltaguard_core::JobEventHub;
    use deltaguard_core::hub::HubConfig;
    use deltaguard_core::progress_log::ProgressLog;
    use deltaguard_core::runner::{RunnerConfig, ScannerMode};
    use deltaguard_core::store::{JobStore, JobStoreError, MemoryJobStore, StoreResult};
    use deltaguard_core::types::{Job, JobPatch, JobSource, JobStatus, NewJob};

    /// Rejects the write that would mark a job done.
    struct NoCompletionStore(MemoryJobStore);

    #[async_trait]
    impl JobStore for NoCompletionStore {
        async fn create(&self, new: NewJob) -> StoreResult<Job> {
            self.0.create(new).await
        }

        async fn get(&self, id: JobId) -> StoreResult<Job> {
            self.0.get(id).await
        }

        async fn list(&self, limit: usize) -> StoreResult<Vec<Job>> {
            self.0.list(limit).await
        }

        async fn update(&self, id: JobId, patch: JobPatch) -> StoreResult<Job> {
            if patch.status == Some(JobStatus::Done) {
                return Err(JobStoreError::Malformed("disk full".into()));
            }
            self.0.update(id, patch).await
        }

        async fn delete(&self, id: JobId) -> StoreResult<bool> {
            self.0.delete(id).await
        }
    }

    fn hub(store: Arc<dyn JobStore>, dir: &std::path::Path) -> JobEventHub {
        JobEventHub::new(
            store,
            Arc::new(ProgressLog::new(dir)),
            HubConfig {
                runner: RunnerConfig {
                    mode: ScannerMode::Mock,
                    ..RunnerConfig::default()
                },
                ..HubConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn supervisor_errors_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(Arc::new(NoCompletionStore(MemoryJobStore::new())), dir.path());
        let job = hub
            .create_job(NewJob::new(JobSource::path("/tmp/fw.bin")))
            .await
            .unwrap();

        let tracker = ScanTracker::new();
        tracker.track(hub.start_job(job.id).await.unwrap());
        let results = tracker.drain(Duration::from_secs(5)).await;

        assert_eq!(results.len(), 1);
        let (id, result) = &results[0];
        assert_eq!(*id, job.id);
        assert!(matches!(
            result,
            Err(RunnerError::Store(JobStoreError::Malformed(_)))
        ));
        assert_eq!(hub.get(job.id).await.unwrap().status, JobStatus::Failed);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn drain_collects_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(Arc::new(MemoryJobStore::new()), dir.path());
        let tracker = ScanTracker::new();
        for _ in 0..2 {
            let job = hub
                .create_job(NewJob::new(JobSource::path("/tmp/fw.bin")))
                .await
                .unwrap();
            tracker.track(hub.start_job(job.id).await.unwrap());
        }

        let results = tracker.drain(Duration::from_secs(5)).await;
        assert_eq!(results.len(), 2);
        assert!(
            results
                .iter()
                .all(|(_, result)| matches!(result, Ok(JobOutcome::Done { .. })))
        );
    }
}
