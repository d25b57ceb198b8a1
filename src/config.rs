use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{QueueError, Result};

/// Which isolation backend runs job steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxBackend {
    /// Run each step directly with `docker run`.
    Container,
    /// Run each step's container inside a per-job firecracker VM managed by ignite.
    #[default]
    IsolatedVm,
}

impl std::fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxBackend::Container => write!(f, "container"),
            SandboxBackend::IsolatedVm => write!(f, "vm"),
        }
    }
}

/// Resource sizing and backend selection for job sandboxes.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    /// Base image of the VM (ignored by the container backend)
    pub vm_image: String,
    /// CPUs given to each VM or container
    pub cpus: u32,
    /// Memory given to each VM or container (e.g., "12G")
    pub memory: String,
    /// Disk size of each VM (e.g., "20G")
    pub disk_space: String,
    /// Directory holding `docker save` archives shared by VMs
    pub image_archive_path: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::default(),
            vm_image: "sourcegraph/ignite-ubuntu:insiders".to_string(),
            cpus: 4,
            memory: "12G".to_string(),
            disk_space: "20G".to_string(),
            image_archive_path: None,
        }
    }
}

impl SandboxConfig {
    pub fn container() -> Self {
        Self {
            backend: SandboxBackend::Container,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 {
            return Err(QueueError::Config("cpus must be at least 1".to_string()));
        }
        if self.memory.trim().is_empty() {
            return Err(QueueError::Config("memory must not be empty".to_string()));
        }
        if self.backend == SandboxBackend::IsolatedVm {
            if self.image_archive_path.is_none() {
                return Err(QueueError::Config(
                    "the vm backend requires an image archive path".to_string(),
                ));
            }
            if self.vm_image.trim().is_empty() || self.disk_space.trim().is_empty() {
                return Err(QueueError::Config(
                    "the vm backend requires a vm image and a disk size".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Settings of the lease manager process.
///
/// The heartbeat grace window and the death threshold are independent:
/// - `heartbeat_grace_ms` bounds how long a freshly dequeued job may be missing
///   from its worker's heartbeats before it is requeued
/// - `death_threshold_ms` bounds how long a worker may stay silent before all
///   of its jobs are requeued; keep it well above the workers' heartbeat interval
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub listen_addr: SocketAddr,
    /// Path prefix the queue routes are mounted under
    pub prefix: String,
    /// Maximum number of jobs leased out at once
    pub max_transactions: usize,
    pub requeue_delay_ms: u64,
    pub cleanup_interval_ms: u64,
    pub heartbeat_grace_ms: u64,
    pub death_threshold_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3189)),
            prefix: "/.internal-code-intel/index-queue".to_string(),
            max_transactions: 10,
            requeue_delay_ms: 60_000,
            cleanup_interval_ms: 10_000,
            heartbeat_grace_ms: 50_000,
            death_threshold_ms: 50_000,
        }
    }
}

impl ManagerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_grace_ms)
    }

    pub fn death_threshold(&self) -> Duration {
        Duration::from_millis(self.death_threshold_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_transactions == 0 {
            return Err(QueueError::Config(
                "max transactions must be at least 1".to_string(),
            ));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(QueueError::Config(
                "cleanup interval must be positive".to_string(),
            ));
        }
        if self.death_threshold_ms == 0 {
            return Err(QueueError::Config(
                "death threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of an indexer worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique name this worker reports to the manager
    pub worker_name: String,
    /// Base URL of the lease manager API (including its route prefix)
    pub manager_url: String,
    /// Base URL used for host-side git fetches
    pub frontend_url: String,
    /// Base URL the upload step reaches from inside the sandbox
    pub frontend_url_from_docker: String,
    /// Token sent as the basic-auth password on every internal request
    pub auth_token: String,
    pub num_handlers: usize,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// How long shutdown waits for in-flight jobs before abandoning them
    pub shutdown_grace_ms: u64,
    pub git_prefix: String,
    pub upload_route: String,
    pub upload_image: String,
    pub sandbox: SandboxConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_name: uuid::Uuid::new_v4().to_string(),
            manager_url: "http://127.0.0.1:3189/.internal-code-intel/index-queue".to_string(),
            frontend_url: "http://127.0.0.1:3080".to_string(),
            frontend_url_from_docker: "http://127.0.0.1:3080".to_string(),
            auth_token: String::new(),
            num_handlers: 1,
            poll_interval_ms: 1_000,
            heartbeat_interval_ms: 1_000,
            shutdown_grace_ms: 10_000,
            git_prefix: "/.internal-code-intel/git".to_string(),
            upload_route: "/.internal-code-intel/lsif/upload".to_string(),
            upload_image: "sourcegraph/src-cli:latest".to_string(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("worker name", &self.worker_name),
            ("manager url", &self.manager_url),
            ("frontend url", &self.frontend_url),
            ("frontend url from docker", &self.frontend_url_from_docker),
            ("upload image", &self.upload_image),
        ] {
            if value.trim().is_empty() {
                return Err(QueueError::Config(format!("{} must not be empty", name)));
            }
        }
        if self.num_handlers == 0 {
            return Err(QueueError::Config(
                "number of handlers must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(QueueError::Config(
                "poll and heartbeat intervals must be positive".to_string(),
            ));
        }
        self.sandbox.validate()
    }
}
