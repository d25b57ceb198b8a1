use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::queue::job::QueueRecord;
use crate::queue::store::{RecordStore, Transaction, TxHandle};

const DEFAULT_MAX_RECORDS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    Queued,
    Processing,
    Completed,
    Errored,
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordState::Queued => write!(f, "queued"),
            RecordState::Processing => write!(f, "processing"),
            RecordState::Completed => write!(f, "completed"),
            RecordState::Errored => write!(f, "errored"),
        }
    }
}

/// A record plus the bookkeeping columns a queue table would carry.
#[derive(Debug, Clone)]
pub struct StoredRecord<R> {
    pub record: R,
    pub state: RecordState,
    /// Held by an open transaction.
    pub locked: bool,
    pub queued_at: DateTime<Utc>,
    pub process_after: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_message: Option<String>,
    pub log_contents: Option<String>,
    pub num_resets: u32,
}

impl<R> StoredRecord<R> {
    fn new(record: R) -> Self {
        Self {
            record,
            state: RecordState::Queued,
            locked: false,
            queued_at: Utc::now(),
            process_after: None,
            started_at: None,
            finished_at: None,
            failure_message: None,
            log_contents: None,
            num_resets: 0,
        }
    }

    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::Queued
            && !self.locked
            && self.process_after.map_or(true, |after| after <= now)
    }
}

#[derive(Debug)]
struct Inner<R> {
    records: BTreeMap<i64, StoredRecord<R>>,
    next_id: i64,
    max_records: usize,
}

/// In-memory record store with row-lock semantics.
///
/// Dequeue marks the oldest ready record as processing and locks it. Writes made
/// through the returned transaction are staged and only applied when the
/// transaction is finalized with `Ok`; finalizing with an error rolls them back
/// and returns the record to the queue.
#[derive(Debug)]
pub struct MemoryStore<R> {
    inner: Arc<Mutex<Inner<R>>>,
}

impl<R> Clone for MemoryStore<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: QueueRecord> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: QueueRecord> MemoryStore<R> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_RECORDS)
    }

    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                records: BTreeMap::new(),
                next_id: 1,
                max_records,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<R>> {
        lock_inner(&self.inner)
    }

    /// Reserve the next record identifier.
    pub fn next_id(&self) -> i64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// Add a record to the queue. Returns false if the store is at capacity or
    /// the identifier is already taken.
    pub fn enqueue(&self, record: R) -> bool {
        let mut inner = self.lock();
        let id = record.record_id();
        if inner.records.len() >= inner.max_records || inner.records.contains_key(&id) {
            return false;
        }
        inner.next_id = inner.next_id.max(id + 1);
        inner.records.insert(id, StoredRecord::new(record));
        true
    }

    pub fn get(&self, id: i64) -> Option<StoredRecord<R>> {
        self.lock().records.get(&id).cloned()
    }

    /// Number of records currently held by an open transaction.
    pub fn locked_count(&self) -> usize {
        self.lock().records.values().filter(|r| r.locked).count()
    }

    pub fn count_in_state(&self, state: RecordState) -> usize {
        self.lock()
            .records
            .values()
            .filter(|r| r.state == state)
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }
}

#[async_trait]
impl<R: QueueRecord> RecordStore for MemoryStore<R> {
    type Record = R;

    async fn dequeue_with_lock(&self) -> Result<Option<(R, TxHandle)>> {
        let now = Utc::now();
        let mut inner = self.lock();

        let Some((&id, stored)) = inner.records.iter_mut().find(|(_, r)| r.is_ready(now)) else {
            return Ok(None);
        };

        stored.state = RecordState::Processing;
        stored.locked = true;
        stored.started_at = Some(now);
        let record = stored.record.clone();

        let tx = MemoryTransaction {
            inner: self.inner.clone(),
            id,
            staged: Mutex::new(Some(Vec::new())),
        };
        Ok(Some((record, Arc::new(tx))))
    }
}

#[derive(Debug, Clone)]
enum StagedWrite {
    Complete,
    Errored(String),
    Requeue(DateTime<Utc>),
    Log(String),
}

/// Transaction over one locked record of a [`MemoryStore`].
struct MemoryTransaction<R> {
    inner: Arc<Mutex<Inner<R>>>,
    id: i64,
    /// `None` once the transaction has been finalized.
    staged: Mutex<Option<Vec<StagedWrite>>>,
}

impl<R> MemoryTransaction<R> {
    fn stage(&self, id: i64, write: StagedWrite) -> Result<()> {
        if id != self.id {
            return Err(QueueError::Store(format!(
                "transaction holds record {} but was asked to modify {}",
                self.id, id
            )));
        }
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        match staged.as_mut() {
            Some(writes) => {
                writes.push(write);
                Ok(())
            }
            None => Err(QueueError::Store("transaction already finalized".to_string())),
        }
    }

    fn apply(&self, writes: Vec<StagedWrite>) {
        let mut inner = lock_inner(&self.inner);
        let Some(stored) = inner.records.get_mut(&self.id) else {
            return;
        };

        let now = Utc::now();
        let mut terminal = false;
        for write in writes {
            match write {
                StagedWrite::Complete => {
                    stored.state = RecordState::Completed;
                    stored.finished_at = Some(now);
                    terminal = true;
                }
                StagedWrite::Errored(message) => {
                    stored.state = RecordState::Errored;
                    stored.failure_message = Some(message);
                    stored.finished_at = Some(now);
                    terminal = true;
                }
                StagedWrite::Requeue(visible_at) => {
                    stored.state = RecordState::Queued;
                    stored.process_after = Some(visible_at);
                    stored.started_at = None;
                    stored.num_resets += 1;
                    terminal = true;
                }
                StagedWrite::Log(contents) => stored.log_contents = Some(contents),
            }
        }

        if !terminal {
            stored.state = RecordState::Queued;
            stored.started_at = None;
        }
        stored.locked = false;
    }

    fn rollback(&self) {
        let mut inner = lock_inner(&self.inner);
        if let Some(stored) = inner.records.get_mut(&self.id) {
            stored.state = RecordState::Queued;
            stored.started_at = None;
            stored.locked = false;
        }
    }
}

#[async_trait]
impl<R: QueueRecord> Transaction for MemoryTransaction<R> {
    async fn mark_complete(&self, id: i64) -> Result<bool> {
        self.stage(id, StagedWrite::Complete)?;
        Ok(true)
    }

    async fn mark_errored(&self, id: i64, failure_message: &str) -> Result<bool> {
        self.stage(id, StagedWrite::Errored(failure_message.to_string()))?;
        Ok(true)
    }

    async fn requeue(&self, id: i64, visible_at: DateTime<Utc>) -> Result<()> {
        self.stage(id, StagedWrite::Requeue(visible_at))
    }

    async fn set_log_contents(&self, id: i64, contents: &str) -> Result<()> {
        self.stage(id, StagedWrite::Log(contents.to_string()))
    }

    async fn done(&self, outcome: Result<()>) -> Result<()> {
        let writes = self
            .staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(writes) = writes else {
            return Err(QueueError::Store("transaction already finalized".to_string()));
        };

        match outcome {
            Ok(()) => {
                self.apply(writes);
                Ok(())
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }
}

fn lock_inner<R>(inner: &Mutex<Inner<R>>) -> MutexGuard<'_, Inner<R>> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}
