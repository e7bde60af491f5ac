//! Scan job lifecycle: `queued -> running -> done | failed`.
//!
//! [`ScanRunner`] moves a queued job to running, launches the scanner and
//! supervises it on a tokio task. Ownership of the terminal write belongs to
//! whoever removes the job from the tracking map first: the supervisor on a
//! natural exit, or [`ScanRunner::cancel`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::progress_log::ProgressLog;
use crate::store::{JobStore, JobStoreError};
use crate::types::{JobId, JobPatch, JobStatus, SUMMARY_STAGE};

pub mod command;
mod supervisor;

pub use command::{ScanInvocation, ScannerMode, build_invocation};

/// Error text recorded on jobs stopped through [`ScanRunner::cancel`].
pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

pub const DEFAULT_SCANNER_PROGRAM: &str = "scanner";
pub const DEFAULT_SCANNER_IMAGE: &str = "deltaguard/scanner:latest";
pub const DEFAULT_UPLOADS_DIR: &str = "var/uploads";

/// Extra wait on top of the grace period for the supervisor to reap the
/// scanner after SIGKILL.
const REAP_MARGIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub mode: ScannerMode,
    pub program: PathBuf,
    pub docker_image: String,
    /// Where object sources are staged before a job is queued.
    pub uploads_dir: PathBuf,
    /// When set, raw scanner output is kept as `<report_dir>/<job-id>.json`.
    pub report_dir: Option<PathBuf>,
    /// Pass `--progress --progress-file` to the scanner.
    pub use_progress: bool,
    /// Time between SIGTERM and SIGKILL on cancellation.
    pub grace_period: Duration,
    /// How often coarse progress is copied onto the job row.
    pub mirror_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            mode: ScannerMode::System,
            program: PathBuf::from(DEFAULT_SCANNER_PROGRAM),
            docker_image: DEFAULT_SCANNER_IMAGE.to_string(),
            uploads_dir: PathBuf::from(DEFAULT_UPLOADS_DIR),
            report_dir: None,
            use_progress: true,
            grace_period: Duration::from_millis(1500),
            mirror_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("job {0} already has a running scan")]
    AlreadyRunning(JobId),

    #[error("job {id} is {status}, only queued jobs can start")]
    NotQueued { id: JobId, status: JobStatus },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("scan supervisor failed: {0}")]
    Supervisor(String),
}

/// How a supervised scan ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Done {
        summary: Value,
        report_location: Option<String>,
    },
    Failed {
        error: String,
    },
    /// Stopped through [`ScanRunner::cancel`], which wrote the terminal state.
    Cancelled,
}

/// Handle to a supervised scan.
#[derive(Debug)]
pub struct ScanHandle {
    job_id: JobId,
    join: JoinHandle<Result<JobOutcome, RunnerError>>,
}

impl ScanHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the supervisor to finish.
    pub async fn wait(self) -> Result<JobOutcome, RunnerError> {
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(RunnerError::Supervisor(err.to_string())),
        }
    }
}

struct TrackedScan {
    cancel: CancellationToken,
    /// Fires once the supervisor has returned and the scanner is gone.
    reaped: CancellationToken,
}

pub(crate) struct RunnerInner {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) log: Arc<ProgressLog>,
    pub(crate) config: RunnerConfig,
    running: Mutex<HashMap<JobId, TrackedScan>>,
}

impl RunnerInner {
    /// Removes the job from tracking. The caller that gets `true` owns the
    /// terminal write.
    pub(crate) fn release(&self, job_id: JobId) -> bool {
        self.running.lock().remove(&job_id).is_some()
    }

    pub(crate) async fn append_summary(&self, job_id: JobId, detail: Value, pct: Option<f32>) {
        if let Err(err) = self.log.append(job_id, SUMMARY_STAGE, Some(detail), pct).await {
            warn!(job = %job_id, error = %err, "failed to append summary record");
        }
    }
}

#[derive(Clone)]
pub struct ScanRunner {
    inner: Arc<RunnerInner>,
}

impl ScanRunner {
    pub fn new(store: Arc<dyn JobStore>, log: Arc<ProgressLog>, config: RunnerConfig) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                store,
                log,
                config,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    /// Moves a queued job to running and launches its scanner.
    pub async fn start(&self, job_id: JobId) -> Result<ScanHandle, RunnerError> {
        let cancel = CancellationToken::new();
        let reaped = CancellationToken::new();
        {
            let mut running = self.inner.running.lock();
            if running.contains_key(&job_id) {
                return Err(RunnerError::AlreadyRunning(job_id));
            }
            running.insert(
                job_id,
                TrackedScan {
                    cancel: cancel.clone(),
                    reaped: reaped.clone(),
                },
            );
        }

        let job = match self.claim(job_id).await {
            Ok(job) => job,
            Err(err) => {
                self.inner.release(job_id);
                reaped.cancel();
                return Err(err);
            }
        };

        info!(job = %job_id, mode = %self.inner.config.mode, "scan started");
        let span = info_span!("scan", job = %job_id);
        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(
            async move {
                let _reaped = reaped.drop_guard();
                supervisor::supervise(inner, job, cancel).await
            }
            .instrument(span),
        );
        Ok(ScanHandle { job_id, join })
    }

    async fn claim(&self, job_id: JobId) -> Result<crate::types::Job, RunnerError> {
        let job = self.inner.store.get(job_id).await?;
        if job.status != JobStatus::Queued {
            return Err(RunnerError::NotQueued {
                id: job_id,
                status: job.status,
            });
        }
        match self
            .inner
            .store
            .update(job_id, JobPatch::running(Utc::now()))
            .await
        {
            Ok(job) => Ok(job),
            Err(JobStoreError::StatusConflict { actual, .. }) => Err(RunnerError::NotQueued {
                id: job_id,
                status: actual,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Stops a running scan and marks the job failed.
    ///
    /// Returns `false` when nothing is tracked for `job_id`. The return value
    /// does not depend on whether the job update succeeded. The scanner may
    /// still be shutting down when this returns; see
    /// [`cancel_and_reap`](Self::cancel_and_reap).
    pub async fn cancel(&self, job_id: JobId) -> bool {
        self.stop(job_id).await.is_some()
    }

    /// Like [`cancel`](Self::cancel), but also waits for the scanner process
    /// to exit, up to the grace period plus a short margin.
    pub async fn cancel_and_reap(&self, job_id: JobId) -> bool {
        let Some(reaped) = self.stop(job_id).await else {
            return false;
        };
        let limit = self.inner.config.grace_period + REAP_MARGIN;
        if timeout(limit, reaped.cancelled()).await.is_err() {
            warn!(job = %job_id, limit = ?limit, "scanner not reaped in time");
        }
        true
    }

    async fn stop(&self, job_id: JobId) -> Option<CancellationToken> {
        let tracked = self.inner.running.lock().remove(&job_id);
        let Some(tracked) = tracked else {
            debug!(job = %job_id, "cancel requested for job that is not running");
            return None;
        };
        tracked.cancel.cancel();
        info!(job = %job_id, "scan cancelled");

        if let Err(err) = self
            .inner
            .store
            .update(job_id, JobPatch::failed(Utc::now(), CANCELLED_MESSAGE))
            .await
        {
            warn!(job = %job_id, error = %err, "failed to record cancellation");
        }
        self.inner
            .append_summary(job_id, json!({ "error": CANCELLED_MESSAGE }), None)
            .await;
        Some(tracked.reaped)
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.inner.running.lock().contains_key(&job_id)
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.inner.running.lock().keys().copied().collect()
    }

    /// Starts every queued job among the `limit` most recent ones.
    pub async fn dispatch_queued(&self, limit: usize) -> Result<Vec<ScanHandle>, RunnerError> {
        let jobs = self.inner.store.list(limit).await?;
        let mut started = Vec::new();
        // Oldest first.
        for job in jobs.into_iter().rev() {
            if job.status != JobStatus::Queued || self.is_running(job.id) {
                continue;
            }
            match self.start(job.id).await {
                Ok(handle) => started.push(handle),
                Err(RunnerError::AlreadyRunning(_) | RunnerError::NotQueued { .. }) => {}
                Err(err) => warn!(job = %job.id, error = %err, "failed to start queued job"),
            }
        }
        Ok(started)
    }

    /// Cancels every tracked scan and waits for the scanners to exit.
    pub async fn shutdown(&self) {
        let jobs = self.running_jobs();
        join_all(jobs.into_iter().map(|job_id| self.cancel_and_reap(job_id))).await;
    }
}

impl fmt::Debug for ScanRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRunner")
            .field("config", &self.inner.config)
            .field("running", &self.inner.running.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryJobStore, MockJobStore};
    use crate::types::{Job, JobSource, NewJob};

    fn runner_with(store: Arc<dyn JobStore>, dir: &std::path::Path) -> ScanRunner {
        ScanRunner::new(
            store,
            Arc::new(ProgressLog::new(dir)),
            RunnerConfig {
                mode: ScannerMode::Mock,
                ..RunnerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn mock_scan_completes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let runner = runner_with(store.clone(), dir.path());
        let job = store
            .create(NewJob::new(JobSource::path("/tmp/fw.bin")))
            .await
            .unwrap();

        let outcome = runner.start(job.id).await.unwrap().wait().await.unwrap();
        assert!(matches!(outcome, JobOutcome::Done { .. }));

        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        assert_eq!(stored.progress_pct, 100);
        assert_eq!(stored.summary.unwrap()["total_findings"], 1);
        assert!(!runner.is_running(job.id));
    }

    #[tokio::test]
    async fn only_queued_jobs_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let runner = runner_with(store.clone(), dir.path());
        let job = store
            .create(NewJob::new(JobSource::path("/tmp/fw.bin")))
            .await
            .unwrap();

        runner.start(job.id).await.unwrap().wait().await.unwrap();
        let err = runner.start(job.id).await.unwrap_err();
        assert!(matches!(
            err,
            RunnerError::NotQueued {
                status: JobStatus::Done,
                ..
            }
        ));
        assert!(!runner.is_running(job.id));
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(Arc::new(MemoryJobStore::new()), dir.path());
        assert!(!runner.cancel(JobId::new()).await);
    }

    #[tokio::test]
    async fn failed_terminal_write_marks_job_failed_with_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let job = Job::from_new(NewJob::new(JobSource::path("/tmp/fw.bin")), Utc::now());
        let job_id = job.id;

        let mut store = MockJobStore::new();
        let queued = job.clone();
        store.expect_get().returning(move |_| Ok(queued.clone()));
        let mut running = job.clone();
        running.status = JobStatus::Running;
        store
            .expect_update()
            .withf(|_, patch| patch.status == Some(JobStatus::Running))
            .times(1)
            .returning(move |_, _| Ok(running.clone()));
        store
            .expect_update()
            .withf(|_, patch| patch.status == Some(JobStatus::Done))
            .times(1)
            .returning(|_, _| Err(JobStoreError::Malformed("disk full".into())));
        let failed_job = job.clone();
        store
            .expect_update()
            .withf(|_, patch| {
                patch.status == Some(JobStatus::Failed)
                    && patch
                        .error_msg
                        .as_deref()
                        .is_some_and(|msg| msg.contains("disk full"))
            })
            .times(1)
            .returning(move |_, _| Ok(failed_job.clone()));

        let runner = runner_with(Arc::new(store), dir.path());
        let err = runner.start(job_id).await.unwrap().wait().await.unwrap_err();
        assert!(matches!(err, RunnerError::Store(JobStoreError::Malformed(_))));
    }
}
