//! Durable job store contract.
//!
//! The rest of the crate only relies on `create`/`get`/`list`/`update`/`delete`.
//! `subscribe_writes` is an optional push channel; stores that cannot offer one
//! keep the default implementation and the change bus falls back to polling.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::types::{Job, JobId, JobPatch, JobStatus, NewJob};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;

/// Channel name used for write notifications.
pub const JOB_EVENTS_CHANNEL: &str = "job_events";

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} is {actual}, expected {expected}")]
    StatusConflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("write notifications unavailable: {0}")]
    PushUnavailable(String),

    #[error("malformed job row: {0}")]
    Malformed(String),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = std::result::Result<T, JobStoreError>;

/// A committed write, as delivered by the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum JobWrite {
    Upserted(Job),
    Deleted(JobId),
}

/// Stream of committed writes, in commit order.
pub type JobWriteStream = Pin<Box<dyn Stream<Item = JobWrite> + Send>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a queued job with `progress_pct = 0`.
    async fn create(&self, new: NewJob) -> StoreResult<Job>;

    async fn get(&self, id: JobId) -> StoreResult<Job>;

    /// Most recent jobs first.
    async fn list(&self, limit: usize) -> StoreResult<Vec<Job>>;

    /// Applies `patch` and returns the updated row. When `patch.only_if` is set
    /// and the current status differs, nothing is written and
    /// [`JobStoreError::StatusConflict`] is returned.
    async fn update(&self, id: JobId, patch: JobPatch) -> StoreResult<Job>;

    /// Removes the row. Returns `false` when it did not exist.
    async fn delete(&self, id: JobId) -> StoreResult<bool>;

    async fn subscribe_writes(&self) -> StoreResult<JobWriteStream> {
        Err(JobStoreError::PushUnavailable(
            "store does not offer write notifications".into(),
        ))
    }
}
