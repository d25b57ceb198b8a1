//! Indexer worker: polls the lease manager and executes jobs.
//!
//! # Components
//!
//! - [`Worker`]: supervisor owning the pollers and the heartbeat task
//! - [`IndexHandler`]: runs one job (fetch, sandboxed steps, upload)
//! - [`sandbox`]: turns job steps into `docker` or `ignite` command lines
//! - [`QueueClient`]: HTTP client of the manager API
//! - [`IdSet`]: in-flight job ids reported by every heartbeat
//!
//! # Execution Flow
//!
//! 1. Each poller dequeues a job on its interval
//! 2. [`IndexHandler::handle`] runs it to completion and flushes its log
//! 3. The poller reports the outcome with `complete`
//! 4. Meanwhile the heartbeat task reports the [`IdSet`] snapshot

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::queue::job::Job;

pub mod client;
pub mod fetch;
pub mod handler;
pub mod heartbeat;
pub mod idset;
pub mod logger;
pub mod runner;
pub mod sandbox;

pub use client::{QueueClient, WorkQueue};
pub use handler::{HandlerOptions, IndexHandler};
pub use heartbeat::HeartbeatSender;
pub use idset::IdSet;
pub use logger::ExecutionLog;
pub use runner::{CommandRunner, ProcessRunner};

/// Pool sizing and timing of a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub num_handlers: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// How long shutdown waits for in-flight jobs before abandoning them.
    pub shutdown_grace: Duration,
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            num_handlers: config.num_handlers,
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// Supervises a fixed pool of pollers plus the heartbeat task.
pub struct Worker<Q: WorkQueue> {
    queue: Arc<Q>,
    handler: Arc<IndexHandler>,
    options: WorkerOptions,
}

impl<Q: WorkQueue> Worker<Q> {
    pub fn new(queue: Arc<Q>, handler: Arc<IndexHandler>, options: WorkerOptions) -> Self {
        Self {
            queue,
            handler,
            options,
        }
    }

    /// Run until `shutdown` fires, then wait up to the grace period for
    /// in-flight jobs. Jobs still running after that are aborted; their child
    /// processes are killed and the manager reclaims their leases.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();

        for poller in 0..self.options.num_handlers {
            let queue = self.queue.clone();
            let handler = self.handler.clone();
            let interval = self.options.poll_interval;
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                poll_loop(poller, queue, handler, interval, shutdown).await;
            });
        }

        let heartbeat = HeartbeatSender::new(self.options.heartbeat_interval);
        let queue = self.queue.clone();
        let idset = self.handler.idset().clone();
        let heartbeat_shutdown = shutdown.clone();
        tasks.spawn(async move {
            heartbeat.run(queue, idset, heartbeat_shutdown).await;
        });

        tracing::info!(pollers = self.options.num_handlers, "Worker started");
        shutdown.cancelled().await;

        let in_flight = self.handler.idset().len();
        tracing::info!(in_flight, "Worker stopping, waiting for in-flight jobs");

        let drained = tokio::time::timeout(self.options.shutdown_grace, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Worker task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                abandoned = ?self.handler.idset().snapshot(),
                "Shutdown grace period elapsed, aborting in-flight jobs"
            );
            tasks.shutdown().await;
        }
    }
}

async fn poll_loop<Q: WorkQueue>(
    poller: usize,
    queue: Arc<Q>,
    handler: Arc<IndexHandler>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match queue.dequeue().await {
            Ok(Some(job)) => process(queue.as_ref(), &handler, &job).await,
            Ok(None) => {}
            Err(e) => tracing::error!(poller, error = %e, "Failed to dequeue job"),
        }
    }
}

/// Run one job and report its outcome.
async fn process<Q: WorkQueue>(queue: &Q, handler: &IndexHandler, job: &Job) {
    let outcome = handler.handle(queue, job).await;
    let failure = outcome.err().map(|e| handler.failure_message(&e));

    if let Err(e) = queue.complete(job.id, failure.as_deref()).await {
        tracing::error!(job_id = job.id, error = %e, "Failed to mark job complete");
    }
}

/// Build a worker from `config` and run it against the manager until `shutdown` fires.
pub async fn run_worker(config: WorkerConfig, shutdown: CancellationToken) -> Result<()> {
    config.validate()?;

    let queue = Arc::new(QueueClient::new(
        &config.manager_url,
        config.worker_name.clone(),
        config.auth_token.clone(),
    )?);
    let handler = Arc::new(IndexHandler::new(
        Arc::new(ProcessRunner),
        IdSet::new(),
        HandlerOptions::from(&config),
    ));

    tracing::info!(
        worker = %config.worker_name,
        manager = %config.manager_url,
        sandbox = %config.sandbox.backend,
        "Starting indexer worker"
    );
    Worker::new(queue, handler, WorkerOptions::from(&config))
        .run(shutdown)
        .await;
    Ok(())
}
