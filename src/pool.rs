use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::lifecycle::Lifecycle;
use crate::reaper::Reaper;
use crate::runner::CommandRunner;
use crate::worker::Worker;

/// How long `stop(true)` waits for each task before giving up on it.
const JOIN_GRACE: Duration = Duration::from_secs(30);

/// How often `wait_for_shutdown` polls the persisted stop generation.
const STOP_POLL: Duration = Duration::from_secs(1);

/// A set of workers plus the lease reaper, sharing one shutdown token.
pub struct WorkerPool {
    lifecycle: Arc<Lifecycle>,
    runner: Arc<dyn CommandRunner>,
    shutdown: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    reaper_handle: Option<JoinHandle<()>>,
    poll_interval: Option<Duration>,
    stop_generation: u64,
}

impl WorkerPool {
    pub fn new(lifecycle: Arc<Lifecycle>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            lifecycle,
            runner,
            shutdown: CancellationToken::new(),
            worker_handles: Vec::new(),
            reaper_handle: None,
            poll_interval: None,
            stop_generation: 0,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Spawn `count` workers and the reaper.
    ///
    /// Stop requests issued before this call are ignored; any later one
    /// stops these workers, even if another process starts in between.
    pub async fn start(&mut self, count: usize) -> Result<()> {
        self.stop_generation = self.lifecycle.stop_generation().await?;

        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }

        let first = self.worker_handles.len() + 1;
        for n in first..first + count {
            self.spawn_worker(format!("worker-{n}"));
        }
        self.start_reaper();

        info!(count, "Worker pool started");
        Ok(())
    }

    fn spawn_worker(&mut self, id: String) {
        let mut worker = Worker::new(
            id.clone(),
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.runner),
        );
        if let Some(interval) = self.poll_interval {
            worker = worker.with_poll_interval(interval);
        }
        let worker = worker.with_stop_generation(self.stop_generation);

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            worker.run(shutdown).await;
        });

        self.worker_handles.push(handle);
        info!(worker_id = %id, "Worker spawned");
    }

    fn start_reaper(&mut self) {
        if self.reaper_handle.is_some() {
            return;
        }

        let reaper = Reaper::new(Arc::clone(&self.lifecycle));
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            reaper.run(shutdown).await;
        });

        self.reaper_handle = Some(handle);
    }

    /// Signal every task to stop after its current job.
    ///
    /// With `wait`, join each task, giving up on any that outlives the grace
    /// period. Without it, return at once and let in-flight jobs finish in
    /// the background.
    pub async fn stop(&mut self, wait: bool) {
        info!("Stopping worker pool");
        self.shutdown.cancel();

        let handles: Vec<_> = self
            .worker_handles
            .drain(..)
            .chain(self.reaper_handle.take())
            .collect();

        if !wait {
            return;
        }

        for handle in handles {
            match tokio::time::timeout(JOIN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Worker task ended abnormally"),
                Err(_) => warn!(
                    grace_secs = JOIN_GRACE.as_secs(),
                    "Worker did not stop within grace period"
                ),
            }
        }

        info!("Worker pool stopped");
    }

    /// Block until Ctrl-C or a persisted stop request, then stop and join.
    pub async fn wait_for_shutdown(&mut self) {
        let lifecycle = Arc::clone(&self.lifecycle);
        let baseline = self.stop_generation;

        let stop_request = async {
            loop {
                tokio::time::sleep(STOP_POLL).await;
                match lifecycle.stop_generation().await {
                    Ok(generation) if generation > baseline => break,
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Failed to read stop signal"),
                }
            }
        };

        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = interrupt => info!("Interrupted, shutting down"),
            _ = stop_request => info!("Stop requested, shutting down"),
            _ = self.shutdown.cancelled() => {}
        }

        self.stop(true).await;
    }
}
