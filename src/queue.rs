use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{ConfigKey, ConfigPatch, QueueConfig};
use crate::dlq::DeadLetterQueue;
use crate::error::Result;
use crate::job::{DlqEntry, Job, JobId, JobSpec, JobState, QueueStatus};
use crate::lifecycle::Lifecycle;
use crate::pool::WorkerPool;
use crate::runner::{CommandRunner, ShellRunner};
use crate::storage::{SqliteStorage, Storage};

/// Entry point for clients: enqueue and inspect jobs, manage the dead
/// letter queue and configuration, and run workers.
pub struct JobQueue {
    storage: Arc<dyn Storage>,
    lifecycle: Arc<Lifecycle>,
    dlq: DeadLetterQueue,
    runner: Arc<dyn CommandRunner>,
    pool: Option<WorkerPool>,
    poll_interval: Option<Duration>,
}

impl JobQueue {
    /// Connect to the database behind a `sqlite:` URL.
    pub async fn new(database_url: &str) -> Result<Self> {
        let storage = SqliteStorage::new(database_url).await?;
        Ok(Self::with_storage(Arc::new(storage)))
    }

    /// Open the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let storage = SqliteStorage::open(path).await?;
        Ok(Self::with_storage(Arc::new(storage)))
    }

    pub fn with_storage(storage: Arc<dyn Storage>) -> Self {
        let lifecycle = Arc::new(Lifecycle::new(Arc::clone(&storage)));

        Self {
            dlq: DeadLetterQueue::new(Arc::clone(&storage)),
            storage,
            lifecycle,
            runner: Arc::new(ShellRunner),
            pool: None,
            poll_interval: None,
        }
    }

    /// Replace the shell runner used by workers started afterwards.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub async fn enqueue(&self, spec: JobSpec) -> Result<Job> {
        self.lifecycle.enqueue(spec).await
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Job> {
        self.lifecycle.get_job(id).await
    }

    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        self.lifecycle.list_jobs(state).await
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        self.lifecycle.status().await
    }

    pub async fn dlq_list(&self) -> Result<Vec<DlqEntry>> {
        self.dlq.list().await
    }

    pub async fn dlq_retry(&self, id: &JobId) -> Result<Job> {
        self.dlq.retry(id).await
    }

    pub async fn dlq_discard(&self, id: &JobId) -> Result<DlqEntry> {
        self.dlq.discard(id).await
    }

    pub async fn get_config(&self) -> Result<QueueConfig> {
        self.lifecycle.config().await
    }

    /// Current value of one key, accepting hyphenated spellings.
    pub async fn config_value(&self, key: &str) -> Result<String> {
        let key: ConfigKey = key.parse()?;
        Ok(self.get_config().await?.value(key))
    }

    /// Validate and persist one setting. Returns the resulting configuration.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<QueueConfig> {
        let key: ConfigKey = key.parse()?;
        let patch = ConfigPatch::parse(key, value)?;

        let config = self.storage.merge_config(&patch).await?;
        info!(key = %key, value = %config.value(key), "Configuration updated");
        Ok(config)
    }

    /// Start `count` workers in this process, defaulting to the configured
    /// `worker_count`.
    pub async fn start_workers(&mut self, count: Option<usize>) -> Result<usize> {
        let count = match count {
            Some(n) => n,
            None => self.get_config().await?.worker_count as usize,
        };

        let lifecycle = &self.lifecycle;
        let runner = &self.runner;
        let poll_interval = self.poll_interval;

        let pool = self.pool.get_or_insert_with(|| {
            let pool = WorkerPool::new(Arc::clone(lifecycle), Arc::clone(runner));
            match poll_interval {
                Some(interval) => pool.with_poll_interval(interval),
                None => pool,
            }
        });

        pool.start(count).await?;
        Ok(count)
    }

    /// Stop the workers started by this process.
    pub async fn stop_workers(&mut self, wait: bool) {
        if let Some(mut pool) = self.pool.take() {
            pool.stop(wait).await;
        }
    }

    /// Ask every worker process sharing this database to stop after its
    /// current job.
    pub async fn request_stop(&self) -> Result<()> {
        let generation = self.storage.request_stop().await?;
        info!(generation, "Stop requested for all workers");
        Ok(())
    }

    /// Block until Ctrl-C or a stop request, then stop local workers.
    pub async fn wait_for_shutdown(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.wait_for_shutdown().await;
        }
    }
}
