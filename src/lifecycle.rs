//! Job state machine.
//!
//! ```text
//! Pending --claim--> Processing --success--> Completed
//!                    Processing --failure, retries left--> Pending (next_retry_at set)
//!                    Processing --failure, budget spent--> Dead (moved to the DLQ)
//! ```
//!
//! Reports are accepted only from the worker holding the claim, and every
//! write is checked against the claim it was decided from, so a stale or
//! foreign report can never move a job.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::job::{
    timestamp, DlqEntry, Expectation, Job, JobId, JobSpec, JobState, JobUpdate, QueueStatus,
};
use crate::storage::{ClaimRequest, Storage, StorageError};

/// Added to the job timeout to form a claim's lease, so a live worker always
/// reports before its lease can expire.
pub const LEASE_GRACE: Duration = Duration::from_secs(30);

pub const LEASE_EXPIRED_ERROR: &str = "lease expired while processing";

const MAX_CONFLICT_RETRIES: usize = 5;

/// A job handed to a worker, with the run timeout its lease was sized for.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: Job,
    pub timeout: Duration,
}

/// Where a failed job ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    Retrying(Job),
    DeadLettered(DlqEntry),
}

pub struct Lifecycle {
    storage: Arc<dyn Storage>,
}

impl Lifecycle {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Validate a spec and store it as a new Pending job.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<Job> {
        if spec.command.trim().is_empty() {
            return Err(QueueError::Validation(
                "Command must be a non-empty string".to_string(),
            ));
        }

        let max_retries = match spec.max_retries {
            Some(n) => u32::try_from(n).map_err(|_| {
                QueueError::Validation("max_retries must be a non-negative integer".to_string())
            })?,
            None => self.storage.get_config().await?.max_retries,
        };

        let id = match spec.id {
            Some(id) if id.trim().is_empty() => {
                return Err(QueueError::Validation("Job id must not be empty".to_string()));
            }
            Some(id) => JobId(id),
            None => JobId::new(),
        };

        let job = Job::new(spec.command)
            .with_id(id)
            .with_max_retries(max_retries);

        let job = self.storage.create(job).await?;
        info!(job_id = %job.id, command = %job.command, max_retries = job.max_retries, "Job enqueued");
        Ok(job)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Job> {
        Ok(self.storage.get(id).await?)
    }

    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        Ok(self.storage.list(state).await?)
    }

    /// Claim the oldest eligible job for `worker_id`, if any.
    pub async fn fetch_ready_job(&self, worker_id: &str) -> Result<Option<ClaimedJob>> {
        let timeout = self.storage.get_config().await?.job_timeout();
        let now = timestamp::now();

        let request = ClaimRequest {
            now,
            worker_id: worker_id.to_string(),
            lease_until: timestamp::add(now, timeout + LEASE_GRACE),
        };

        let Some(job) = self.storage.claim(&request).await? else {
            return Ok(None);
        };
        debug!(job_id = %job.id, worker_id, "Job claimed");
        Ok(Some(ClaimedJob { job, timeout }))
    }

    /// Mark a job Completed. Only the worker holding the claim may do so.
    pub async fn mark_completed(&self, id: &JobId, worker_id: &str) -> Result<Job> {
        let update = JobUpdate::state(JobState::Completed)
            .release_lease()
            .expecting(Expectation::held_by(worker_id));

        let job = match self.storage.update(id, update).await {
            Ok(job) => job,
            Err(StorageError::Conflict(_)) => return Err(not_claimed(id, worker_id)),
            Err(e) => return Err(e.into()),
        };

        info!(job_id = %job.id, attempts = job.attempts, "Job completed");
        Ok(job)
    }

    /// Record a failure reported by the worker holding the claim: schedule a
    /// retry with backoff, or dead-letter the job once its retry budget is
    /// spent.
    pub async fn mark_failed(
        &self,
        id: &JobId,
        worker_id: &str,
        error: Option<String>,
    ) -> Result<FailureOutcome> {
        let holder = Expectation::held_by(worker_id);

        for _ in 0..MAX_CONFLICT_RETRIES {
            let job = self.storage.get(id).await?;
            if !holder.matches(&job) {
                return Err(not_claimed(id, worker_id));
            }

            match self.fail_claimed(&job, error.clone()).await {
                Err(QueueError::Store(StorageError::Conflict(_))) => {
                    debug!(job_id = %id, "Job changed while recording failure, re-reading");
                }
                outcome => return outcome,
            }
        }

        Err(QueueError::Store(StorageError::Conflict(id.clone())))
    }

    /// Decide the failure from the Processing snapshot `job` and write it
    /// only if the stored job still carries the same claim.
    async fn fail_claimed(&self, job: &Job, error: Option<String>) -> Result<FailureOutcome> {
        let Some(expect) = Expectation::of(job) else {
            let holder = job.claimed_by.as_deref().unwrap_or_default();
            return Err(not_claimed(&job.id, holder));
        };
        let attempts = job.attempts.saturating_add(1);

        if attempts > job.max_retries {
            let update = JobUpdate::state(JobState::Dead)
                .attempts(attempts)
                .last_error(error)
                .release_lease()
                .expecting(expect);

            let entry = self.storage.move_to_dead_letter(&job.id, update).await?;
            warn!(
                job_id = %job.id,
                attempts,
                max_retries = job.max_retries,
                error = entry.job.last_error.as_deref().unwrap_or_default(),
                "Job exceeded max retries, moved to dead letter queue"
            );
            return Ok(FailureOutcome::DeadLettered(entry));
        }

        let config = self.storage.get_config().await?;
        let delay = BackoffPolicy::from_config(&config).delay(attempts);
        let next_retry_at = timestamp::add(timestamp::now(), delay);

        let update = JobUpdate::state(JobState::Pending)
            .attempts(attempts)
            .next_retry_at(Some(next_retry_at))
            .last_error(error)
            .release_lease()
            .expecting(expect);

        let job = self.storage.update(&job.id, update).await?;
        info!(
            job_id = %job.id,
            attempts,
            max_retries = job.max_retries,
            delay_secs = delay.as_secs_f64(),
            "Job failed, scheduled for retry"
        );
        Ok(FailureOutcome::Retrying(job))
    }

    /// Treat every Processing job whose lease ran out as failed. Returns how
    /// many jobs were recovered.
    pub async fn recover_expired_leases(&self) -> Result<usize> {
        let expired = self.storage.list_expired_leases(timestamp::now()).await?;
        let mut recovered = 0;

        for job in expired {
            match self
                .fail_claimed(&job, Some(LEASE_EXPIRED_ERROR.to_string()))
                .await
            {
                Ok(_) => {
                    recovered += 1;
                    warn!(
                        job_id = %job.id,
                        worker_id = job.claimed_by.as_deref().unwrap_or_default(),
                        "Recovered job with expired lease"
                    );
                }
                Err(QueueError::Store(StorageError::Conflict(_)))
                | Err(QueueError::NotFound(_))
                | Err(QueueError::NotClaimed { .. }) => {
                    debug!(job_id = %job.id, "Job was reported before its lease could be recovered");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(recovered)
    }

    /// Counts over the active jobs plus the size of the dead letter queue.
    pub async fn status(&self) -> Result<QueueStatus> {
        let jobs = self.storage.list(None).await?;
        let dead_letters = self.storage.list_dead_letters().await?;

        let mut status = QueueStatus {
            total: jobs.len() as u64,
            dlq_total: dead_letters.len() as u64,
            ..QueueStatus::default()
        };

        for job in jobs.iter().chain(dead_letters.iter().map(|e| &e.job)) {
            match job.state {
                JobState::Pending => status.pending += 1,
                JobState::Processing => status.processing += 1,
                JobState::Completed => status.completed += 1,
                JobState::Dead => status.failed_dead += 1,
            }
        }

        Ok(status)
    }

    pub async fn config(&self) -> Result<QueueConfig> {
        Ok(self.storage.get_config().await?)
    }

    pub async fn stop_generation(&self) -> Result<u64> {
        Ok(self.storage.stop_generation().await?)
    }
}

fn not_claimed(id: &JobId, worker_id: &str) -> QueueError {
    QueueError::NotClaimed {
        id: id.clone(),
        worker_id: worker_id.to_string(),
    }
}
