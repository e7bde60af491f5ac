use thiserror::Error;

use crate::runner::RunnerError;
use crate::store::JobStoreError;
use crate::types::JobId;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Store(JobStoreError),

    #[error(transparent)]
    Runner(RunnerError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoreError::NotFound(_)
                | CoreError::Store(JobStoreError::NotFound(_))
                | CoreError::Runner(RunnerError::Store(JobStoreError::NotFound(_)))
        )
    }
}

impl From<JobStoreError> for CoreError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => CoreError::NotFound(id),
            other => CoreError::Store(other),
        }
    }
}

impl From<RunnerError> for CoreError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Store(store) => store.into(),
            other => CoreError::Runner(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
