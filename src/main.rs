use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use index_queue::config::{ManagerConfig, SandboxBackend, SandboxConfig, WorkerConfig};
use index_queue::manager::{load_jobs, run_manager};
use index_queue::queue::{Job, MemoryStore};
use index_queue::shutdown::install_shutdown_handler;
use index_queue::worker::run_worker;

#[derive(Parser, Debug)]
#[command(name = "index-queue")]
#[command(version)]
#[command(about = "Lease-based job queue for remote code-indexing workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the lease manager and its HTTP API
    Manager(ManagerArgs),

    /// Run an indexer worker against a lease manager
    Worker(WorkerArgs),
}

// =============================================================================
// Manager Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ManagerArgs {
    /// Address to serve the queue API on
    #[arg(long, env = "INDEX_QUEUE_LISTEN_ADDR", default_value = "0.0.0.0:3189")]
    listen_addr: SocketAddr,

    /// Path prefix of the queue routes
    #[arg(
        long,
        env = "INDEX_QUEUE_PREFIX",
        default_value = "/.internal-code-intel/index-queue"
    )]
    prefix: String,

    /// Maximum number of jobs leased out at once
    #[arg(long, env = "INDEX_QUEUE_MAX_TRANSACTIONS", default_value = "10")]
    max_transactions: usize,

    /// Delay before a reclaimed job can be dequeued again
    #[arg(long, env = "INDEX_QUEUE_REQUEUE_DELAY_MS", default_value = "60000")]
    requeue_delay_ms: u64,

    /// Interval of the unresponsive-worker sweep
    #[arg(long, env = "INDEX_QUEUE_CLEANUP_INTERVAL_MS", default_value = "10000")]
    cleanup_interval_ms: u64,

    /// Age below which a job missing from a heartbeat is still considered live
    #[arg(long, env = "INDEX_QUEUE_HEARTBEAT_GRACE_MS", default_value = "50000")]
    heartbeat_grace_ms: u64,

    /// Silence after which a worker loses all of its jobs
    #[arg(long, env = "INDEX_QUEUE_DEATH_THRESHOLD_MS", default_value = "50000")]
    death_threshold_ms: u64,

    /// JSON array of jobs to enqueue at startup
    #[arg(long, env = "INDEX_QUEUE_JOBS_FILE")]
    jobs_file: Option<PathBuf>,
}

impl ManagerArgs {
    fn into_config(self) -> (ManagerConfig, Option<PathBuf>) {
        let config = ManagerConfig {
            listen_addr: self.listen_addr,
            prefix: self.prefix,
            max_transactions: self.max_transactions,
            requeue_delay_ms: self.requeue_delay_ms,
            cleanup_interval_ms: self.cleanup_interval_ms,
            heartbeat_grace_ms: self.heartbeat_grace_ms,
            death_threshold_ms: self.death_threshold_ms,
        };
        (config, self.jobs_file)
    }
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    /// Plain docker containers
    Container,
    /// Containers inside a per-job ignite VM
    Vm,
}

impl From<Backend> for SandboxBackend {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Container => SandboxBackend::Container,
            Backend::Vm => SandboxBackend::IsolatedVm,
        }
    }
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Base URL of the lease manager API, including its route prefix
    #[arg(
        long,
        env = "INDEX_QUEUE_MANAGER_URL",
        default_value = "http://127.0.0.1:3189/.internal-code-intel/index-queue"
    )]
    manager_url: String,

    /// Base URL of the frontend git and upload endpoints
    #[arg(long, env = "INDEX_QUEUE_FRONTEND_URL", default_value = "http://127.0.0.1:3080")]
    frontend_url: String,

    /// Frontend URL as reachable from inside the sandbox (defaults to --frontend-url)
    #[arg(long, env = "INDEX_QUEUE_FRONTEND_URL_FROM_DOCKER")]
    frontend_url_from_docker: Option<String>,

    /// Token used as the basic-auth password on internal requests
    #[arg(long, env = "INDEX_QUEUE_AUTH_TOKEN", default_value = "", hide_env_values = true)]
    auth_token: String,

    /// Unique name of this worker (random when unset)
    #[arg(long, env = "INDEX_QUEUE_WORKER_NAME")]
    worker_name: Option<String>,

    /// Number of jobs processed concurrently
    #[arg(long, env = "INDEX_QUEUE_NUM_HANDLERS", default_value = "1")]
    num_handlers: usize,

    #[arg(long, env = "INDEX_QUEUE_POLL_INTERVAL_MS", default_value = "1000")]
    poll_interval_ms: u64,

    #[arg(long, env = "INDEX_QUEUE_HEARTBEAT_INTERVAL_MS", default_value = "1000")]
    heartbeat_interval_ms: u64,

    /// How long shutdown waits for in-flight jobs
    #[arg(long, env = "INDEX_QUEUE_SHUTDOWN_GRACE_MS", default_value = "10000")]
    shutdown_grace_ms: u64,

    #[arg(long, env = "INDEX_QUEUE_GIT_PREFIX", default_value = "/.internal-code-intel/git")]
    git_prefix: String,

    #[arg(
        long,
        env = "INDEX_QUEUE_UPLOAD_ROUTE",
        default_value = "/.internal-code-intel/lsif/upload"
    )]
    upload_route: String,

    /// Image that runs the upload step
    #[arg(long, env = "INDEX_QUEUE_UPLOAD_IMAGE", default_value = "sourcegraph/src-cli:latest")]
    upload_image: String,

    // === Sandbox Options ===
    /// Isolation backend for job steps
    #[arg(long, env = "INDEX_QUEUE_SANDBOX", value_enum, default_value = "vm")]
    sandbox: Backend,

    /// Base image of job VMs
    #[arg(
        long,
        env = "INDEX_QUEUE_VM_IMAGE",
        default_value = "sourcegraph/ignite-ubuntu:insiders"
    )]
    vm_image: String,

    #[arg(long, env = "INDEX_QUEUE_CPUS", default_value = "4")]
    cpus: u32,

    #[arg(long, env = "INDEX_QUEUE_MEMORY", default_value = "12G")]
    memory: String,

    /// Disk size of job VMs
    #[arg(long, env = "INDEX_QUEUE_DISK", default_value = "20G")]
    disk: String,

    /// Directory for `docker save` archives shared by job VMs (required with --sandbox vm)
    #[arg(long, env = "INDEX_QUEUE_IMAGE_ARCHIVE_PATH")]
    image_archive_path: Option<PathBuf>,
}

impl WorkerArgs {
    fn into_config(self) -> WorkerConfig {
        let defaults = WorkerConfig::default();
        WorkerConfig {
            worker_name: self.worker_name.unwrap_or(defaults.worker_name),
            frontend_url_from_docker: self
                .frontend_url_from_docker
                .unwrap_or_else(|| self.frontend_url.clone()),
            manager_url: self.manager_url,
            frontend_url: self.frontend_url,
            auth_token: self.auth_token,
            num_handlers: self.num_handlers,
            poll_interval_ms: self.poll_interval_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            shutdown_grace_ms: self.shutdown_grace_ms,
            git_prefix: self.git_prefix,
            upload_route: self.upload_route,
            upload_image: self.upload_image,
            sandbox: SandboxConfig {
                backend: self.sandbox.into(),
                vm_image: self.vm_image,
                cpus: self.cpus,
                memory: self.memory,
                disk_space: self.disk,
                image_archive_path: self.image_archive_path,
            },
        }
    }
}

// =============================================================================
// Entry Points
// =============================================================================

async fn run_manager_command(args: ManagerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (config, jobs_file) = args.into_config();
    config.validate()?;

    let store = MemoryStore::<Job>::new();
    if let Some(path) = jobs_file {
        let added = load_jobs(&store, &path)?;
        tracing::info!(jobs = added, path = %path.display(), "Loaded jobs");
    }

    let shutdown = install_shutdown_handler()?;
    tracing::info!(
        addr = %config.listen_addr,
        max_transactions = config.max_transactions,
        "Starting lease manager"
    );
    run_manager(config, store, shutdown).await?;
    tracing::info!("Lease manager stopped");
    Ok(())
}

async fn run_worker_command(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.into_config();
    config.validate()?;

    let shutdown = install_shutdown_handler()?;
    run_worker(config, shutdown).await?;
    tracing::info!("Worker stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Manager(manager_args) => run_manager_command(manager_args).await?,
        Commands::Worker(worker_args) => run_worker_command(worker_args).await?,
    }

    Ok(())
}
