use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use super::{JobStore, JobStoreError, JobWrite, JobWriteStream, StoreResult};
use crate::types::{Job, JobId, JobPatch, NewJob};

const DEFAULT_WRITE_CHANNEL_CAPACITY: usize = 256;

/// In-process job store. Used by tests and when no database is configured.
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    writes: Option<broadcast::Sender<JobWrite>>,
}

impl MemoryJobStore {
    /// Store with a write-notification channel.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_WRITE_CHANNEL_CAPACITY);
        Self {
            jobs: RwLock::new(HashMap::new()),
            writes: Some(tx),
        }
    }

    /// Store that reports write notifications as unavailable.
    pub fn without_push() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            writes: None,
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    fn notify(&self, write: JobWrite) {
        if let Some(tx) = &self.writes {
            let _ = tx.send(write);
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryJobStore")
            .field("push", &self.writes.is_some())
            .field(
                "write_subscribers",
                &self.writes.as_ref().map(|tx| tx.receiver_count()),
            )
            .finish()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, new: NewJob) -> StoreResult<Job> {
        let job = Job::from_new(new, Utc::now());
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id, job.clone());
        self.notify(JobWrite::Upserted(job.clone()));
        Ok(job)
    }

    async fn get(&self, id: JobId) -> StoreResult<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(JobStoreError::NotFound(id))
    }

    async fn list(&self, limit: usize) -> StoreResult<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut rows: Vec<Job> = jobs.values().cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> StoreResult<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        if let Some(expected) = patch.only_if
            && job.status != expected
        {
            return Err(JobStoreError::StatusConflict {
                id,
                expected,
                actual: job.status,
            });
        }
        if let Some(next) = patch.status
            && next != job.status
            && !job.status.can_transition_to(next)
        {
            return Err(JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to: next,
            });
        }

        patch.apply_to(job);
        let updated = job.clone();
        self.notify(JobWrite::Upserted(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, id: JobId) -> StoreResult<bool> {
        let mut jobs = self.jobs.write().await;
        let removed = jobs.remove(&id).is_some();
        if removed {
            self.notify(JobWrite::Deleted(id));
        }
        Ok(removed)
    }

    async fn subscribe_writes(&self) -> StoreResult<JobWriteStream> {
        let Some(tx) = &self.writes else {
            return Err(JobStoreError::PushUnavailable(
                "memory store created without a write channel".into(),
            ));
        };

        let stream = BroadcastStream::new(tx.subscribe()).filter_map(|item| match item {
            Ok(write) => Some(write),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "job write subscriber lagged; notifications dropped");
                None
            }
        });
        Ok(Box::pin(stream))
    }
}
