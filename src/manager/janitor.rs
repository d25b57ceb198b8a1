use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::manager::lease::LeaseManager;
use crate::queue::store::RecordStore;

/// Periodically reclaims the jobs of workers that stopped heartbeating.
///
/// On cancellation the janitor closes every held transaction before returning,
/// so the process never exits while a record is still locked.
pub struct Janitor<S: RecordStore> {
    manager: Arc<LeaseManager<S>>,
    interval: Duration,
}

impl<S: RecordStore> Janitor<S> {
    pub fn new(manager: Arc<LeaseManager<S>>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.manager.prune_dead_workers().await {
                        tracing::error!(error = %e, "Failed to requeue jobs of unresponsive workers");
                    }
                }
            }
        }

        tracing::info!("Janitor stopping, releasing held jobs");
        self.manager.shutdown().await;
    }
}
