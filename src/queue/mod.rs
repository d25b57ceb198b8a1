//! Job records and the record store the lease manager sits on.
//!
//! - [`Job`]: the indexing job payload handed to workers
//! - [`RecordStore`] / [`Transaction`]: atomic dequeue-with-lock and the
//!   writes made while a record is locked
//! - [`MemoryStore`]: an in-memory store with row-lock semantics

pub mod job;
pub mod memory;
pub mod store;

pub use job::{Job, QueueRecord, Step};
pub use memory::{MemoryStore, RecordState};
pub use store::{RecordStore, Transaction, TxHandle};
