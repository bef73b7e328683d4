use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::job::{DlqEntry, Job, JobId, JobState, JobUpdate};
use crate::storage::Storage;

/// Inspection and resubmission of dead-lettered jobs
pub struct DeadLetterQueue {
    storage: Arc<dyn Storage>,
}

impl DeadLetterQueue {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn list(&self) -> Result<Vec<DlqEntry>> {
        Ok(self.storage.list_dead_letters().await?)
    }

    /// Put a dead job back in circulation with a fresh retry budget.
    pub async fn retry(&self, id: &JobId) -> Result<Job> {
        let reset = JobUpdate::state(JobState::Pending)
            .attempts(0)
            .next_retry_at(None)
            .last_error(None)
            .release_lease();

        let job = self.storage.restore_dead_letter(id, reset).await?;
        info!(job_id = %job.id, "Job requeued from dead letter queue");
        Ok(job)
    }

    /// Drop a dead job for good.
    pub async fn discard(&self, id: &JobId) -> Result<DlqEntry> {
        let entry = self.storage.remove_from_dead_letter(id).await?;
        info!(job_id = %entry.job.id, "Job discarded from dead letter queue");
        Ok(entry)
    }
}
