pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{ConfigPatch, QueueConfig};
use crate::job::{DlqEntry, Job, JobId, JobState, JobUpdate};

pub use sqlite::SqliteStorage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job with id {0} already exists")]
    DuplicateId(JobId),

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {0} changed concurrently")]
    Conflict(JobId),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Parameters of a claim: who takes the job and until when.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub now: DateTime<Utc>,
    pub worker_id: String,
    pub lease_until: DateTime<Utc>,
}

/// Durable home of the active jobs, the dead letter queue and the
/// configuration.
///
/// Every method is a single atomic step against the current stored state
/// and has committed by the time it returns.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create(&self, job: Job) -> Result<Job>;
    async fn get(&self, id: &JobId) -> Result<Job>;
    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>>;
    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<Job>;

    /// Take the oldest eligible job and mark it Processing. No two callers,
    /// in this process or another, ever receive the same job.
    async fn claim(&self, request: &ClaimRequest) -> Result<Option<Job>>;
    async fn list_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Remove the job from the active set, apply `update` and append it to
    /// the dead letter queue.
    async fn move_to_dead_letter(&self, id: &JobId, update: JobUpdate) -> Result<DlqEntry>;
    async fn list_dead_letters(&self) -> Result<Vec<DlqEntry>>;
    async fn remove_from_dead_letter(&self, id: &JobId) -> Result<DlqEntry>;

    /// Remove a dead letter, apply `update` and put it back in the active set.
    async fn restore_dead_letter(&self, id: &JobId, update: JobUpdate) -> Result<Job>;

    async fn get_config(&self) -> Result<QueueConfig>;
    async fn merge_config(&self, patch: &ConfigPatch) -> Result<QueueConfig>;


    /// Bump the stop generation. Workers started under an older generation
    /// stop after their current job. Returns the new generation.
    async fn request_stop(&self) -> Result<u64>;
    async fn stop_generation(&self) -> Result<u64>;
}
