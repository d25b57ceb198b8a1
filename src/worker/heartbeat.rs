use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::worker::client::WorkQueue;
use crate::worker::idset::IdSet;

/// Periodically reports the worker's in-flight jobs to the manager.
///
/// Runs independently of the pollers, so a long job never delays its own
/// heartbeat.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Send a heartbeat every interval until `shutdown` fires.
    pub async fn run<Q>(&self, queue: Arc<Q>, idset: IdSet, shutdown: CancellationToken)
    where
        Q: WorkQueue + ?Sized,
    {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let ids = idset.snapshot();
            if let Err(e) = queue.heartbeat(&ids).await {
                tracing::error!(error = %e, jobs = ids.len(), "Failed to send heartbeat");
            }
        }
    }
}
