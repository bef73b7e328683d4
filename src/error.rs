use crate::config::ConfigError;
use crate::job::JobId;
use crate::storage::StorageError;

/// Errors returned by queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("{0}")]
    Validation(String),

    #[error("Job with id {0} already exists")]
    DuplicateId(JobId),

    #[error("Job {0} not found")]
    NotFound(JobId),

    /// A report came from a worker that no longer holds the job.
    #[error("Job {id} is not processing under worker {worker_id}")]
    NotClaimed { id: JobId, worker_id: String },

    #[error("Storage error: {0}")]
    Store(#[source] StorageError),
}

impl From<StorageError> for QueueError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::DuplicateId(id) => QueueError::DuplicateId(id),
            StorageError::NotFound(id) => QueueError::NotFound(id),
            other => QueueError::Store(other),
        }
    }
}

impl From<ConfigError> for QueueError {
    fn from(e: ConfigError) -> Self {
        QueueError::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
