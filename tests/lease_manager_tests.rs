
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use index_queue::error::{QueueError, Result};
use index_queue::manager::LeaseManager;
use index_queue::queue::{Job, MemoryStore, RecordState, RecordStore, Transaction, TxHandle};
use test_harness::{manager_with_jobs, sample_job, test_options, FailingStore};

/// Parks an operation until the test lets it through.
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

/// A [`MemoryStore`] whose dequeues or log writes can be held at a [`Gate`].
#[derive(Clone)]
struct GatedStore {
    inner: MemoryStore<Job>,
    dequeue_gate: Option<Arc<Gate>>,
    log_gate: Option<Arc<Gate>>,
}

struct GatedTransaction {
    inner: TxHandle,
    log_gate: Option<Arc<Gate>>,
}

#[async_trait]
impl Transaction for GatedTransaction {
    async fn mark_complete(&self, id: i64) -> Result<bool> {
        self.inner.mark_complete(id).await
    }

    async fn mark_errored(&self, id: i64, failure_message: &str) -> Result<bool> {
        self.inner.mark_errored(id, failure_message).await
    }

    async fn requeue(&self, id: i64, visible_at: DateTime<Utc>) -> Result<()> {
        self.inner.requeue(id, visible_at).await
    }

    async fn set_log_contents(&self, id: i64, contents: &str) -> Result<()> {
        if let Some(gate) = &self.log_gate {
            gate.pass().await;
        }
        self.inner.set_log_contents(id, contents).await
    }

    async fn done(&self, outcome: Result<()>) -> Result<()> {
        self.inner.done(outcome).await
    }
}

#[async_trait]
impl RecordStore for GatedStore {
    type Record = Job;

    async fn dequeue_with_lock(&self) -> Result<Option<(Job, TxHandle)>> {
        let Some((job, tx)) = self.inner.dequeue_with_lock().await? else {
            return Ok(None);
        };
        if let Some(gate) = &self.dequeue_gate {
            gate.pass().await;
        }
        let tx: TxHandle = Arc::new(GatedTransaction {
            inner: tx,
            log_gate: self.log_gate.clone(),
        });
        Ok(Some((job, tx)))
    }
}

fn gated_store(dequeue_gate: Option<Arc<Gate>>, log_gate: Option<Arc<Gate>>) -> GatedStore {
    let inner = MemoryStore::new();
    assert!(inner.enqueue(sample_job(1)));
    GatedStore {
        inner,
        dequeue_gate,
        log_gate,
    }
}

#[tokio::test]
async fn test_each_job_is_leased_once() {
    let (manager, store) = manager_with_jobs(3, test_options(10));

    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.dequeue(&format!("worker-{}", i % 2)).await.unwrap()
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            ids.push(job.id);
        }
    }

    let unique: HashSet<i64> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(unique.len(), 3);
    assert_eq!(store.locked_count(), 3);
    assert_eq!(manager.active_leases().await, 3);
}

#[tokio::test]
async fn test_dequeue_respects_transaction_limit() {
    let (manager, store) = manager_with_jobs(3, test_options(2));

    assert!(manager.dequeue("w1").await.unwrap().is_some());
    assert!(manager.dequeue("w2").await.unwrap().is_some());
    assert_eq!(manager.available_slots(), 0);

    // Limiter full: the store is not consulted at all.
    assert!(manager.dequeue("w1").await.unwrap().is_none());
    assert_eq!(store.locked_count(), 2);
    assert_eq!(store.count_in_state(RecordState::Queued), 1);

    let held = manager.leased_ids("w1").await;
    assert!(manager.complete("w1", held[0], None).await.unwrap());
    assert_eq!(manager.available_slots(), 1);

    let third = manager.dequeue("w1").await.unwrap().expect("slot was released");
    assert_eq!(third.id, 3);
}

#[tokio::test]
async fn test_slots_equal_limit_minus_leases() {
    let (manager, _store) = manager_with_jobs(5, test_options(4));

    for worker in ["a", "b", "a"] {
        manager.dequeue(worker).await.unwrap();
        assert_eq!(
            manager.available_slots(),
            4 - manager.active_leases().await
        );
    }

    let ids = manager.leased_ids("a").await;
    manager.complete("a", ids[0], Some("boom")).await.unwrap();
    assert_eq!(manager.available_slots(), 4 - manager.active_leases().await);

    manager.shutdown().await;
    assert_eq!(manager.available_slots(), 4);
}

#[tokio::test]
async fn test_empty_store_releases_slot() {
    let (manager, _store) = manager_with_jobs(0, test_options(1));

    assert!(manager.dequeue("w1").await.unwrap().is_none());
    assert_eq!(manager.available_slots(), 1);
    assert_eq!(manager.active_leases().await, 0);
}

#[tokio::test]
async fn test_store_error_releases_slot() {
    let manager = LeaseManager::new(FailingStore, test_options(1));

    assert!(manager.dequeue("w1").await.is_err());
    assert_eq!(manager.available_slots(), 1);
    assert!(manager.worker_names().await.is_empty());
}

#[tokio::test]
async fn test_complete_is_idempotent() {
    let (manager, store) = manager_with_jobs(1, test_options(10));
    let job = manager.dequeue("w1").await.unwrap().unwrap();

    assert!(manager.complete("w1", job.id, None).await.unwrap());
    assert!(!manager.complete("w1", job.id, None).await.unwrap());

    let stored = store.get(job.id).unwrap();
    assert_eq!(stored.state, RecordState::Completed);
    assert!(!stored.locked);
    assert_eq!(manager.available_slots(), 10);
}

#[tokio::test]
async fn test_complete_by_other_worker_is_unknown() {
    let (manager, store) = manager_with_jobs(1, test_options(10));
    let job = manager.dequeue("w1").await.unwrap().unwrap();

    assert!(!manager.complete("w2", job.id, None).await.unwrap());
    assert_eq!(store.get(job.id).unwrap().state, RecordState::Processing);
    assert_eq!(manager.leased_ids("w1").await, vec![job.id]);
}

#[tokio::test]
async fn test_complete_with_error_marks_errored() {
    let (manager, store) = manager_with_jobs(2, test_options(10));
    let failed = manager.dequeue("w1").await.unwrap().unwrap();
    let succeeded = manager.dequeue("w1").await.unwrap().unwrap();

    manager
        .complete("w1", failed.id, Some("failed to index repository"))
        .await
        .unwrap();
    // An empty message counts as success.
    manager.complete("w1", succeeded.id, Some("")).await.unwrap();

    let failed = store.get(failed.id).unwrap();
    assert_eq!(failed.state, RecordState::Errored);
    assert_eq!(
        failed.failure_message.as_deref(),
        Some("failed to index repository")
    );
    assert_eq!(
        store.get(succeeded.id).unwrap().state,
        RecordState::Completed
    );
}

#[tokio::test]
async fn test_set_log_contents_is_persisted_on_completion() {
    let (manager, store) = manager_with_jobs(1, test_options(10));
    let job = manager.dequeue("w1").await.unwrap().unwrap();

    manager
        .set_log_contents("w1", job.id, "git init\n")
        .await
        .unwrap();
    manager.complete("w1", job.id, None).await.unwrap();

    assert_eq!(
        store.get(job.id).unwrap().log_contents.as_deref(),
        Some("git init\n")
    );
}

#[tokio::test]
async fn test_set_log_contents_for_unknown_lease_is_noop() {
    let (manager, store) = manager_with_jobs(1, test_options(10));

    manager.set_log_contents("w1", 1, "ignored").await.unwrap();
    manager.set_log_contents("ghost", 42, "ignored").await.unwrap();

    assert!(store.get(1).unwrap().log_contents.is_none());
    assert!(manager.worker_names().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_grace_protects_fresh_leases() {
    let (manager, store) = manager_with_jobs(1, test_options(10));
    let job = manager.dequeue("w1").await.unwrap().unwrap();

    // Dequeued moments ago: missing from the heartbeat is fine.
    manager.heartbeat("w1", &[]).await.unwrap();
    assert_eq!(manager.leased_ids("w1").await, vec![job.id]);

    tokio::time::advance(Duration::from_secs(4)).await;
    manager.heartbeat("w1", &[]).await.unwrap();
    assert_eq!(manager.leased_ids("w1").await, vec![job.id]);

    tokio::time::advance(Duration::from_secs(2)).await;
    manager.heartbeat("w1", &[]).await.unwrap();
    assert!(manager.leased_ids("w1").await.is_empty());

    let stored = store.get(job.id).unwrap();
    assert_eq!(stored.state, RecordState::Queued);
    assert_eq!(stored.num_resets, 1);
    assert!(!stored.locked);
    assert_eq!(manager.available_slots(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_reported_jobs_stay_leased() {
    let (manager, store) = manager_with_jobs(2, test_options(10));
    let kept = manager.dequeue("w1").await.unwrap().unwrap();
    let dropped = manager.dequeue("w1").await.unwrap().unwrap();

    tokio::time::advance(Duration::from_secs(10)).await;
    manager.heartbeat("w1", &[kept.id]).await.unwrap();

    assert_eq!(manager.leased_ids("w1").await, vec![kept.id]);
    assert_eq!(store.get(kept.id).unwrap().state, RecordState::Processing);
    assert_eq!(store.get(dropped.id).unwrap().state, RecordState::Queued);
}

#[tokio::test(start_paused = true)]
async fn test_requeued_job_is_delayed() {
    let (manager, _store) = manager_with_jobs(1, test_options(10));
    let job = manager.dequeue("w1").await.unwrap().unwrap();

    tokio::time::advance(Duration::from_secs(6)).await;
    manager.heartbeat("w1", &[]).await.unwrap();

    // Visible again only after the requeue delay.
    assert!(manager.dequeue("w2").await.unwrap().is_none());
    assert!(!manager.complete("w1", job.id, None).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_from_other_worker_leaves_leases_alone() {
    let (manager, _store) = manager_with_jobs(1, test_options(10));
    let job = manager.dequeue("w1").await.unwrap().unwrap();

    tokio::time::advance(Duration::from_secs(10)).await;
    manager.heartbeat("w2", &[]).await.unwrap();

    assert_eq!(manager.leased_ids("w1").await, vec![job.id]);
    assert_eq!(manager.worker_names().await, vec!["w1", "w2"]);
}

#[tokio::test(start_paused = true)]
async fn test_silent_worker_loses_its_jobs() {
    let (manager, store) = manager_with_jobs(2, test_options(10));
    manager.dequeue("w1").await.unwrap().unwrap();
    manager.dequeue("w1").await.unwrap().unwrap();

    tokio::time::advance(Duration::from_secs(29)).await;
    manager.prune_dead_workers().await.unwrap();
    assert_eq!(manager.active_leases().await, 2);

    tokio::time::advance(Duration::from_secs(2)).await;
    manager.prune_dead_workers().await.unwrap();

    assert_eq!(manager.active_leases().await, 0);
    assert!(manager.worker_names().await.is_empty());
    assert_eq!(store.count_in_state(RecordState::Queued), 2);
    assert_eq!(store.locked_count(), 0);
    assert_eq!(manager.available_slots(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeating_worker_survives_prune() {
    let (manager, _store) = manager_with_jobs(1, test_options(10));
    let job = manager.dequeue("w1").await.unwrap().unwrap();

    for _ in 0..4 {
        tokio::time::advance(Duration::from_secs(20)).await;
        manager.heartbeat("w1", &[job.id]).await.unwrap();
        manager.prune_dead_workers().await.unwrap();
    }

    assert_eq!(manager.leased_ids("w1").await, vec![job.id]);
}

#[tokio::test(start_paused = true)]
async fn test_completion_after_reclaim_is_unknown() {
    let (manager, store) = manager_with_jobs(1, test_options(10));
    let job = manager.dequeue("w1").await.unwrap().unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;
    manager.prune_dead_workers().await.unwrap();

    assert!(!manager.complete("w1", job.id, None).await.unwrap());
    assert_eq!(store.get(job.id).unwrap().state, RecordState::Queued);
}

#[tokio::test]
async fn test_shutdown_releases_every_lease() {
    let (manager, store) = manager_with_jobs(3, test_options(10));
    manager.dequeue("w1").await.unwrap().unwrap();
    manager.dequeue("w2").await.unwrap().unwrap();
    manager
        .set_log_contents("w1", 1, "partial")
        .await
        .unwrap();

    manager.shutdown().await;

    assert_eq!(manager.active_leases().await, 0);
    assert_eq!(manager.available_slots(), 10);
    assert_eq!(store.locked_count(), 0);
    assert_eq!(store.count_in_state(RecordState::Queued), 3);
    // Rolled back, so the staged log write is discarded.
    assert!(store.get(1).unwrap().log_contents.is_none());
}

#[tokio::test]
async fn test_concurrent_complete_and_prune_finalize_once() {
    let (manager, store) = manager_with_jobs(1, test_options(10));
    let job = manager.dequeue("w1").await.unwrap().unwrap();

    let completer = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.complete("w1", job.id, None).await.unwrap() })
    };
    let heartbeat = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.heartbeat("w1", &[job.id]).await.unwrap() })
    };

    assert!(completer.await.unwrap());
    heartbeat.await.unwrap();
    assert_eq!(store.get(job.id).unwrap().state, RecordState::Completed);
    assert_eq!(manager.available_slots(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_log_write_racing_reclaim_is_a_noop() {
    let gate = Arc::new(Gate::default());
    let store = gated_store(None, Some(gate.clone()));
    let manager = Arc::new(LeaseManager::new(store.clone(), test_options(10)));
    let job = manager.dequeue("w1").await.unwrap().unwrap();

    let writer = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.set_log_contents("w1", job.id, "late log").await })
    };
    gate.entered.notified().await;

    // The lease is reclaimed while the write is in flight.
    tokio::time::advance(Duration::from_secs(6)).await;
    manager.heartbeat("w1", &[]).await.unwrap();
    gate.release.notify_one();

    writer.await.unwrap().unwrap();
    let stored = store.inner.get(job.id).unwrap();
    assert_eq!(stored.state, RecordState::Queued);
    assert!(stored.log_contents.is_none());
}

#[tokio::test]
async fn test_dequeue_after_shutdown_is_refused() {
    let (manager, store) = manager_with_jobs(1, test_options(10));
    manager.shutdown().await;

    let err = manager.dequeue("w1").await.unwrap_err();
    assert!(matches!(err, QueueError::ShuttingDown));
    assert_eq!(store.count_in_state(RecordState::Queued), 1);
    assert_eq!(store.locked_count(), 0);
}

#[tokio::test]
async fn test_dequeue_racing_shutdown_releases_its_record() {
    let gate = Arc::new(Gate::default());
    let store = gated_store(Some(gate.clone()), None);
    let manager = Arc::new(LeaseManager::new(store.clone(), test_options(10)));

    let dequeuer = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.dequeue("w1").await })
    };
    gate.entered.notified().await;

    manager.shutdown().await;
    gate.release.notify_one();

    let err = dequeuer.await.unwrap().unwrap_err();
    assert!(matches!(err, QueueError::ShuttingDown));
    assert_eq!(manager.active_leases().await, 0);
    assert_eq!(manager.available_slots(), 10);
    assert_eq!(store.inner.locked_count(), 0);
    assert_eq!(store.inner.get(1).unwrap().state, RecordState::Queued);
}
