use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, Result};
use crate::job::Job;
use crate::lifecycle::{ClaimedJob, FailureOutcome, Lifecycle};
use crate::runner::CommandRunner;

/// Characters of stderr kept in a failure diagnostic.
const STDERR_EXCERPT_CHARS: usize = 200;

/// Worker that claims jobs and runs their commands
pub struct Worker {
    id: String,
    lifecycle: Arc<Lifecycle>,
    runner: Arc<dyn CommandRunner>,
    poll_interval: Duration,
    error_pause: Duration,
    stop_generation: u64,
}

impl Worker {
    pub fn new(id: String, lifecycle: Arc<Lifecycle>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            id,
            lifecycle,
            runner,
            poll_interval: Duration::from_millis(500),
            error_pause: Duration::from_secs(1),
            stop_generation: 0,
        }
    }

    /// Stop once the persisted stop generation moves past `generation`.
    pub fn with_stop_generation(mut self, generation: u64) -> Self {
        self.stop_generation = generation;
        self
    }

    /// Set the idle wait between empty polls
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run until shutdown is signaled, in-process or through the store.
    ///
    /// Shutdown is only observed between jobs: a claimed job is always run
    /// and reported before the worker exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.lifecycle.stop_generation().await {
                Ok(generation) if generation > self.stop_generation => {
                    info!(worker_id = %self.id, "Worker received stop signal");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to read stop signal");
                    self.idle(&shutdown, self.error_pause).await;
                    continue;
                }
            }

            match self.lifecycle.fetch_ready_job(&self.id).await {
                Ok(Some(claimed)) => {
                    let job_id = claimed.job.id.clone();
                    if let Err(e) = self.process(claimed).await {
                        error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to report job outcome");
                        tokio::time::sleep(self.error_pause).await;
                    }
                }
                Ok(None) => self.idle(&shutdown, self.poll_interval).await,
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to fetch next job");
                    self.idle(&shutdown, self.error_pause).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn idle(&self, shutdown: &CancellationToken, duration: Duration) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Run one claimed job within the timeout its lease was sized for, and
    /// report the outcome. A report refused because the claim was lost is
    /// logged and dropped.
    pub async fn process(&self, claimed: ClaimedJob) -> Result<()> {
        let ClaimedJob { job, timeout } = claimed;
        debug!(worker_id = %self.id, job_id = %job.id, command = %job.command, "Processing job");

        let reported = match self.runner.run(&job.command, Some(timeout)).await {
            Ok(output) if output.success() => self
                .lifecycle
                .mark_completed(&job.id, &self.id)
                .await
                .map(|_| info!(worker_id = %self.id, job_id = %job.id, "Job succeeded")),
            Ok(output) => {
                let mut diagnostic = format!("Exit code {}", output.exit_code);
                let stderr = output.stderr.trim();
                if !stderr.is_empty() {
                    diagnostic.push_str(": ");
                    diagnostic.extend(stderr.chars().take(STDERR_EXCERPT_CHARS));
                }
                self.report_failure(&job, diagnostic).await
            }
            Err(e) => self.report_failure(&job, e.to_string()).await,
        };

        match reported {
            Err(QueueError::NotClaimed { .. }) => {
                warn!(worker_id = %self.id, job_id = %job.id, "Lease lost before the outcome was recorded");
                Ok(())
            }
            other => other,
        }
    }

    async fn report_failure(&self, job: &Job, diagnostic: String) -> Result<()> {
        warn!(worker_id = %self.id, job_id = %job.id, error = %diagnostic, "Job failed");

        match self.lifecycle.mark_failed(&job.id, &self.id, Some(diagnostic)).await? {
            FailureOutcome::Retrying(job) => {
                debug!(job_id = %job.id, attempts = job.attempts, "Job will be retried");
            }
            FailureOutcome::DeadLettered(entry) => {
                debug!(job_id = %entry.job.id, attempts = entry.job.attempts, "Job dead-lettered");
            }
        }
        Ok(())
    }
}
