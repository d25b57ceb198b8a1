//! Lease manager: hands jobs to workers and reclaims them from dead ones.
//!
//! # Components
//!
//! - [`LeaseManager`]: lease table over a [`RecordStore`], bounded by a
//!   dequeue semaphore
//! - [`Janitor`]: timer that reclaims the jobs of silent workers and closes
//!   every transaction on shutdown
//! - [`api`]: the JSON/HTTP routes workers call

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::error::{QueueError, Result};
use crate::queue::job::Job;
use crate::queue::memory::MemoryStore;
use crate::queue::store::RecordStore;

pub mod api;
pub mod janitor;
pub mod lease;

pub use janitor::Janitor;
pub use lease::{LeaseManager, LeaseOptions};

/// Read a JSON array of jobs and enqueue them. Returns how many were added.
pub fn load_jobs(store: &MemoryStore<Job>, path: &Path) -> Result<usize> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| QueueError::from(e).context(format!("failed to read {}", path.display())))?;
    let jobs: Vec<Job> = serde_json::from_str(&contents)
        .map_err(|e| QueueError::Config(format!("invalid jobs file {}: {}", path.display(), e)))?;

    let mut added = 0;
    for job in jobs {
        let id = job.id;
        if store.enqueue(job) {
            added += 1;
        } else {
            tracing::warn!(job_id = id, "Duplicate job id in jobs file, skipped");
        }
    }
    Ok(added)
}

/// Serve the queue API over `store` until `shutdown` fires.
///
/// The janitor runs alongside the server and is stopped only after the server
/// has drained, so its final sweep closes every transaction the manager held.
pub async fn run_manager<S: RecordStore>(
    config: ManagerConfig,
    store: S,
    shutdown: CancellationToken,
) -> Result<()> {
    config.validate()?;

    let manager = Arc::new(LeaseManager::new(store, LeaseOptions::from(&config)));
    let janitor = Janitor::new(manager.clone(), config.cleanup_interval());
    let janitor_shutdown = CancellationToken::new();
    let janitor_task = {
        let janitor_shutdown = janitor_shutdown.clone();
        tokio::spawn(async move { janitor.run(janitor_shutdown).await })
    };

    let served =
        api::run_api_server(config.listen_addr, manager.clone(), &config.prefix, shutdown).await;

    janitor_shutdown.cancel();
    if let Err(e) = janitor_task.await {
        tracing::error!(error = %e, "Janitor task failed");
        manager.shutdown().await;
    }

    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_jobs_enqueues_each_job_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": 1, "repositoryName": "github.com/a/b", "commit": "c1"}},
                {{"id": 2, "repositoryName": "github.com/a/b", "commit": "c2"}},
                {{"id": 1, "repositoryName": "github.com/a/b", "commit": "c1"}}
            ]"#
        )
        .unwrap();

        let store = MemoryStore::new();
        assert_eq!(load_jobs(&store, file.path()).unwrap(), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn load_jobs_rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let store = MemoryStore::<Job>::new();
        assert!(matches!(
            load_jobs(&store, file.path()),
            Err(QueueError::Config(_))
        ));
    }
}
