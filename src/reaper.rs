use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::lifecycle::Lifecycle;

/// Periodically fails jobs whose claim lease has expired, so work held by a
/// crashed worker goes back through the retry path.
pub struct Reaper {
    lifecycle: Arc<Lifecycle>,
    interval: Duration,
}

impl Reaper {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            lifecycle,
            interval: Duration::from_secs(5),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Lease reaper started");

        loop {
            self.tick().await;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Lease reaper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    async fn tick(&self) {
        match self.lifecycle.recover_expired_leases().await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Recovered jobs with expired leases"),
            Err(e) => error!(error = %e, "Failed to recover expired leases"),
        }
    }
}
