use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::JobId;

pub const DEFAULT_MODE: &str = "light";
pub const DEFAULT_FORMAT: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Statuses only move forward: queued, then running, then one terminal state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    /// Ordering used for list snapshots: running first, then queued, then the rest.
    pub fn snapshot_rank(&self) -> u8 {
        match self {
            JobStatus::Running => 0,
            JobStatus::Queued => 1,
            JobStatus::Done | JobStatus::Failed => 2,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status `{other}`")),
        }
    }
}

/// Where the artifact to scan comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobSource {
    Object { bucket: String, object_key: String },
    Path { path: PathBuf },
}

impl JobSource {
    pub fn object(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        JobSource::Object {
            bucket: bucket.into(),
            object_key: key.into(),
        }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        JobSource::Path { path: path.into() }
    }

    /// Local file the scanner reads. Object sources are staged under
    /// `uploads_dir` by basename before the job is queued.
    pub fn local_input(&self, uploads_dir: &Path) -> PathBuf {
        match self {
            JobSource::Path { path } => path.clone(),
            JobSource::Object { object_key, .. } => {
                let base = Path::new(object_key)
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(object_key));
                uploads_dir.join(base)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(flatten)]
    pub source: JobSource,
    pub mode: String,
    pub format: String,
    pub refs: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress_pct: u8,
    pub progress_msg: Option<String>,
    pub report_location: Option<String>,
    pub error_msg: Option<String>,
    pub summary: Option<Value>,
}

impl Job {
    pub fn from_new(new: NewJob, created_at: DateTime<Utc>) -> Self {
        Self {
            id: new.id.unwrap_or_default(),
            status: JobStatus::Queued,
            source: new.source,
            mode: new.mode.unwrap_or_else(|| DEFAULT_MODE.to_string()),
            format: new.format.unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
            refs: new.refs,
            created_at,
            started_at: None,
            finished_at: None,
            progress_pct: 0,
            progress_msg: None,
            report_location: None,
            error_msg: None,
            summary: None,
        }
    }
}

/// Request to create a job. Unset options fall back to the store defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(default)]
    pub id: Option<JobId>,
    #[serde(flatten)]
    pub source: JobSource,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub refs: bool,
}

impl NewJob {
    pub fn new(source: JobSource) -> Self {
        Self {
            id: None,
            source,
            mode: None,
            format: None,
            refs: false,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

/// Partial update applied by [`JobStore::update`](crate::store::JobStore::update).
///
/// `None` leaves a field untouched. `only_if` turns the write into a
/// compare-and-swap on the current status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress_pct: Option<u8>,
    pub progress_msg: Option<String>,
    pub report_location: Option<String>,
    pub error_msg: Option<String>,
    pub summary: Option<Value>,
    pub only_if: Option<JobStatus>,
}

impl JobPatch {
    pub fn running(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Running),
            started_at: Some(now),
            only_if: Some(JobStatus::Queued),
            ..Self::default()
        }
    }

    pub fn done(
        now: DateTime<Utc>,
        report_location: Option<String>,
        summary: Value,
    ) -> Self {
        Self {
            status: Some(JobStatus::Done),
            finished_at: Some(now),
            progress_pct: Some(100),
            report_location,
            summary: Some(summary),
            only_if: Some(JobStatus::Running),
            ..Self::default()
        }
    }

    pub fn failed(now: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            finished_at: Some(now),
            error_msg: Some(error.into()),
            only_if: Some(JobStatus::Running),
            ..Self::default()
        }
    }

    pub fn progress(pct: u8, message: Option<String>) -> Self {
        Self {
            progress_pct: Some(pct.min(100)),
            progress_msg: message,
            only_if: Some(JobStatus::Running),
            ..Self::default()
        }
    }

    /// Applies the patch in place. Progress never moves backwards.
    pub fn apply_to(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(started_at) = self.started_at {
            job.started_at = Some(started_at);
        }
        if let Some(finished_at) = self.finished_at {
            job.finished_at = Some(finished_at);
        }
        if let Some(pct) = self.progress_pct {
            job.progress_pct = job.progress_pct.max(pct.min(100));
        }
        if let Some(msg) = &self.progress_msg {
            job.progress_msg = Some(msg.clone());
        }
        if let Some(location) = &self.report_location {
            job.report_location = Some(location.clone());
        }
        if let Some(error) = &self.error_msg {
            job.error_msg = Some(error.clone());
        }
        if let Some(summary) = &self.summary {
            job.summary = Some(summary.clone());
        }
    }
}
