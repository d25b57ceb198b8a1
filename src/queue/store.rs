//! Record store abstraction the lease manager is built on.
//!
//! A store hands out records together with the transaction that holds the
//! record's row lock. Every write concerning a leased record goes through that
//! transaction, and the lock is released only when the transaction is
//! finalized with [`Transaction::done`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::queue::job::QueueRecord;

/// A transaction holding the exclusive lock on one dequeued record.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Mark the record as successfully processed. Returns false if the record
    /// was not in a state that could be completed.
    async fn mark_complete(&self, id: i64) -> Result<bool>;

    /// Mark the record as failed with the given message.
    async fn mark_errored(&self, id: i64, failure_message: &str) -> Result<bool>;

    /// Put the record back in the queue, invisible to dequeue until `visible_at`.
    async fn requeue(&self, id: i64, visible_at: DateTime<Utc>) -> Result<()>;

    /// Attach the execution log to the record.
    async fn set_log_contents(&self, id: i64, contents: &str) -> Result<()>;

    /// Finalize the transaction. `Ok` commits staged writes, `Err` rolls them
    /// back. The outcome error (if any) is passed through so callers can use
    /// `tx.done(result).await` as their return value.
    async fn done(&self, outcome: Result<()>) -> Result<()>;
}

/// Shared transaction handle, as held by a lease.
pub type TxHandle = Arc<dyn Transaction>;

/// A persisted queue of records supporting atomic dequeue-with-lock.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    type Record: QueueRecord;

    /// Lock and return one eligible record, or `None` if nothing is ready.
    async fn dequeue_with_lock(&self) -> Result<Option<(Self::Record, TxHandle)>>;
}

