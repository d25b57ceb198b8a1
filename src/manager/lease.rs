use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::ManagerConfig;
use crate::error::{QueueError, Result};
use crate::queue::job::QueueRecord;
use crate::queue::store::{RecordStore, TxHandle};

/// Timing and sizing knobs of a [`LeaseManager`].
#[derive(Debug, Clone)]
pub struct LeaseOptions {
    /// Maximum number of leases outstanding at once, across all workers.
    pub max_transactions: usize,
    /// How far in the future a reclaimed job becomes visible again.
    pub requeue_delay: Duration,
    /// Leases younger than this are live even if missing from a heartbeat.
    pub heartbeat_grace: Duration,
    /// Workers silent for longer than this lose all of their leases.
    pub death_threshold: Duration,
}

impl From<&ManagerConfig> for LeaseOptions {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            max_transactions: config.max_transactions,
            requeue_delay: config.requeue_delay(),
            heartbeat_grace: config.heartbeat_grace(),
            death_threshold: config.death_threshold(),
        }
    }
}

/// A dequeued record bound to the transaction locking it.
///
/// The concurrency-limiter permit lives inside the lease, so the slot is
/// returned exactly once: when the lease is dropped after its transaction has
/// been finalized.
struct Lease<R> {
    record: R,
    tx: TxHandle,
    started: Instant,
    _permit: OwnedSemaphorePermit,
}

impl<R: QueueRecord> Lease<R> {
    fn id(&self) -> i64 {
        self.record.record_id()
    }
}

/// Liveness record of one worker.
struct WorkerState<R> {
    last_heartbeat: Instant,
    leases: HashMap<i64, Lease<R>>,
}

impl<R> WorkerState<R> {
    fn new(now: Instant) -> Self {
        Self {
            last_heartbeat: now,
            leases: HashMap::new(),
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_heartbeat = self.last_heartbeat.max(now);
    }
}

/// Hands out records to named workers and tracks the transactions locking them.
///
/// Every mutation of the lease table happens under one mutex. Store calls are
/// made after the lock is released, on leases that were either removed from
/// the table or whose transaction handle was cloned out of it.
pub struct LeaseManager<S: RecordStore> {
    store: S,
    options: LeaseOptions,
    workers: Mutex<HashMap<String, WorkerState<S::Record>>>,
    dequeue_slots: Arc<Semaphore>,
    /// Set by [`LeaseManager::shutdown`] while holding `workers`.
    closed: AtomicBool,
}

impl<S: RecordStore> LeaseManager<S> {
    pub fn new(store: S, options: LeaseOptions) -> Self {
        Self {
            dequeue_slots: Arc::new(Semaphore::new(options.max_transactions)),
            store,
            options,
            workers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn options(&self) -> &LeaseOptions {
        &self.options
    }

    /// Lock one queued record and lease it to `worker_name`.
    ///
    /// Returns `Ok(None)` without touching the store when every dequeue slot is
    /// taken, and `Ok(None)` when the store has nothing ready.
    ///
    /// Fails with [`QueueError::ShuttingDown`] once [`LeaseManager::shutdown`]
    /// has started.
    pub async fn dequeue(&self, worker_name: &str) -> Result<Option<S::Record>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::ShuttingDown);
        }
        let Ok(permit) = self.dequeue_slots.clone().try_acquire_owned() else {
            tracing::debug!(worker = worker_name, "All dequeue slots in use");
            return Ok(None);
        };

        // Dropping `permit` on any early return hands the slot back.
        let Some((record, tx)) = self.store.dequeue_with_lock().await? else {
            return Ok(None);
        };

        let id = record.record_id();
        let now = Instant::now();
        let lease = Lease {
            record: record.clone(),
            tx,
            started: now,
            _permit: permit,
        };

        let refused = {
            let mut workers = self.workers.lock().await;
            if self.closed.load(Ordering::Acquire) {
                Some(lease)
            } else {
                let worker = workers
                    .entry(worker_name.to_string())
                    .or_insert_with(|| WorkerState::new(now));
                worker.touch(now);
                worker.leases.insert(id, lease);
                None
            }
        };

        // Shutdown already drained the table; release the record ourselves.
        if let Some(lease) = refused {
            if let Err(e) = lease.tx.done(Err(QueueError::ShuttingDown)).await {
                if !matches!(e, QueueError::ShuttingDown) {
                    tracing::error!(job_id = id, error = %e, "Failed to close transaction holding job");
                }
            }
            return Err(QueueError::ShuttingDown);
        }

        tracing::info!(job_id = id, worker = worker_name, "Job leased");
        Ok(Some(record))
    }

    /// Write the execution log of a leased job through its transaction.
    ///
    /// A missing lease is not an error: the job may already have been reclaimed.
    pub async fn set_log_contents(
        &self,
        worker_name: &str,
        job_id: i64,
        contents: &str,
    ) -> Result<()> {
        let tx = {
            let workers = self.workers.lock().await;
            workers
                .get(worker_name)
                .and_then(|w| w.leases.get(&job_id))
                .map(|lease| lease.tx.clone())
        };

        let Some(tx) = tx else {
            tracing::debug!(job_id, worker = worker_name, "Ignoring log for unknown lease");
            return Ok(());
        };

        match tx.set_log_contents(job_id, contents).await {
            Ok(()) => Ok(()),
            // Reclaimed between the lookup and the write.
            Err(e) if !self.holds(worker_name, job_id, &tx).await => {
                tracing::debug!(
                    job_id,
                    worker = worker_name,
                    error = %e,
                    "Ignoring log for lease reclaimed mid-write"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Whether `worker_name` still leases `job_id` through `tx`.
    async fn holds(&self, worker_name: &str, job_id: i64, tx: &TxHandle) -> bool {
        self.workers
            .lock()
            .await
            .get(worker_name)
            .and_then(|w| w.leases.get(&job_id))
            .is_some_and(|lease| Arc::ptr_eq(&lease.tx, tx))
    }

    /// Finish a leased job. An absent or empty `error_message` marks success.
    ///
    /// Returns `Ok(false)` if `worker_name` holds no lease on `job_id`, which
    /// happens on double completion or after the job was reclaimed.
    pub async fn complete(
        &self,
        worker_name: &str,
        job_id: i64,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let lease = {
            let mut workers = self.workers.lock().await;
            workers
                .get_mut(worker_name)
                .and_then(|w| w.leases.remove(&job_id))
        };
        let Some(lease) = lease else {
            tracing::debug!(job_id, worker = worker_name, "Completion for unknown lease");
            return Ok(false);
        };

        let outcome = match error_message.filter(|m| !m.is_empty()) {
            None => lease.tx.mark_complete(job_id).await.map(|_| ()),
            Some(message) => lease.tx.mark_errored(job_id, message).await.map(|_| ()),
        };
        lease.tx.done(outcome).await?;

        tracing::info!(
            job_id,
            worker = worker_name,
            failed = error_message.is_some_and(|m| !m.is_empty()),
            "Job completed"
        );
        Ok(true)
    }

    /// Record a heartbeat and requeue leases the worker no longer reports.
    ///
    /// Only leases older than the grace window can be declared dead this way; a
    /// job dequeued moments ago may legitimately be missing from the report.
    pub async fn heartbeat(&self, worker_name: &str, live_ids: &[i64]) -> Result<()> {
        let dead = self.prune_unreported(worker_name, live_ids).await;
        self.requeue_all(dead).await
    }

    /// Requeue every lease of workers that have been silent past the death
    /// threshold and forget those workers.
    pub async fn prune_dead_workers(&self) -> Result<()> {
        let dead = {
            let now = Instant::now();
            let mut workers = self.workers.lock().await;
            let names: Vec<String> = workers
                .iter()
                .filter(|(_, w)| now.duration_since(w.last_heartbeat) > self.options.death_threshold)
                .map(|(name, _)| name.clone())
                .collect();

            let mut dead = Vec::new();
            for name in names {
                if let Some(worker) = workers.remove(&name) {
                    tracing::warn!(
                        worker = %name,
                        leases = worker.leases.len(),
                        "Worker unresponsive, reclaiming its jobs"
                    );
                    dead.extend(worker.leases.into_values());
                }
            }
            dead
        };

        self.requeue_all(dead).await
    }

    /// Roll back every held transaction and refuse further dequeues. Called
    /// once on process shutdown.
    pub async fn shutdown(&self) {
        let leases: Vec<Lease<S::Record>> = {
            let mut workers = self.workers.lock().await;
            self.closed.store(true, Ordering::Release);
            workers
                .drain()
                .flat_map(|(_, w)| w.leases.into_values())
                .collect()
        };

        for lease in leases {
            match lease.tx.done(Err(QueueError::ShuttingDown)).await {
                Ok(()) | Err(QueueError::ShuttingDown) => {}
                Err(e) => tracing::error!(
                    job_id = lease.id(),
                    error = %e,
                    "Failed to close transaction holding job"
                ),
            }
        }
    }

    /// Number of leases currently held across all workers.
    pub async fn active_leases(&self) -> usize {
        self.workers
            .lock()
            .await
            .values()
            .map(|w| w.leases.len())
            .sum()
    }

    /// Number of dequeue slots not bound to a lease.
    pub fn available_slots(&self) -> usize {
        self.dequeue_slots.available_permits()
    }

    /// Names of workers with a liveness record, sorted.
    pub async fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Job ids leased to `worker_name`, sorted.
    pub async fn leased_ids(&self, worker_name: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .workers
            .lock()
            .await
            .get(worker_name)
            .map(|w| w.leases.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    async fn prune_unreported(&self, worker_name: &str, live_ids: &[i64]) -> Vec<Lease<S::Record>> {
        let live: HashSet<i64> = live_ids.iter().copied().collect();
        let now = Instant::now();

        let mut workers = self.workers.lock().await;
        let worker = workers
            .entry(worker_name.to_string())
            .or_insert_with(|| WorkerState::new(now));
        worker.touch(now);

        let stale: Vec<i64> = worker
            .leases
            .iter()
            .filter(|(id, lease)| {
                !live.contains(id) && now.duration_since(lease.started) >= self.options.heartbeat_grace
            })
            .map(|(id, _)| *id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| worker.leases.remove(&id))
            .inspect(|lease| {
                tracing::warn!(
                    job_id = lease.id(),
                    worker = worker_name,
                    "Job missing from heartbeat, reclaiming"
                )
            })
            .collect()
    }

    async fn requeue_all(&self, leases: Vec<Lease<S::Record>>) -> Result<()> {
        let mut errors = None;
        for lease in leases {
            if let Err(e) = self.requeue(lease).await {
                errors = Some(QueueError::append(errors, e));
            }
        }
        errors.map_or(Ok(()), Err)
    }

    async fn requeue(&self, lease: Lease<S::Record>) -> Result<()> {
        let id = lease.id();
        let outcome = lease.tx.requeue(id, self.visible_at()).await;
        lease.tx.done(outcome).await
    }

    fn visible_at(&self) -> DateTime<Utc> {
        let now = Utc::now();
        chrono::Duration::from_std(self.options.requeue_delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
