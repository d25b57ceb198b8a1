//! Sandboxes that job steps run in.
//!
//! A sandbox turns a [`SandboxCommand`] (image, arguments, working directory,
//! environment) into a host command line. Two backends exist:
//!
//! - [`ContainerFormatter`]: a plain `docker run` per step, with the job's
//!   source tree bind-mounted at `/data`
//! - [`VmFormatter`]: a per-job firecracker VM started with ignite; every step
//!   runs as a container inside that VM
//!
//! The backend is chosen once per job from [`SandboxConfig`] and used through
//! the [`Formatter`] trait.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use crate::config::{SandboxBackend, SandboxConfig};
use crate::error::Result;
use crate::worker::logger::ExecutionLog;
use crate::worker::runner::CommandRunner;

pub mod container;
pub mod vm;

pub use container::ContainerFormatter;
pub use vm::{sanitize_image, VmFormatter};

/// A containerized command, independent of where the container runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCommand {
    pub image: String,
    pub args: Vec<String>,
    /// Working directory relative to the job's source tree.
    pub workdir: String,
    pub env: BTreeMap<String, String>,
}

impl SandboxCommand {
    pub fn new<I, S>(image: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            image: image.into(),
            args: args.into_iter().map(Into::into).collect(),
            workdir: String::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Lifecycle of one job's sandbox.
#[async_trait]
pub trait Formatter: Send + Sync {
    /// Prepare the sandbox so that every image in `images` can be run.
    async fn setup(
        &self,
        runner: &dyn CommandRunner,
        log: &ExecutionLog,
        images: &[String],
    ) -> Result<()>;

    /// Release everything `setup` created.
    async fn teardown(&self, runner: &dyn CommandRunner, log: &ExecutionLog) -> Result<()>;

    /// Host command line that runs `command` inside the sandbox.
    fn format_command(&self, command: &SandboxCommand) -> Vec<String>;
}

/// The configured backend for one job.
#[derive(Debug, Clone)]
pub enum Sandbox {
    Container(ContainerFormatter),
    IsolatedVm(VmFormatter),
}

impl Sandbox {
    /// Build the backend selected by `config` for a job checked out in `repo_dir`.
    pub fn new(config: &SandboxConfig, repo_dir: &Path) -> Result<Self> {
        let repo_dir = repo_dir.to_string_lossy();
        Ok(match config.backend {
            SandboxBackend::Container => {
                Sandbox::Container(ContainerFormatter::new(repo_dir, config))
            }
            SandboxBackend::IsolatedVm => {
                let name = uuid::Uuid::new_v4().to_string();
                Sandbox::IsolatedVm(VmFormatter::new(name, repo_dir, config)?)
            }
        })
    }

    pub fn backend(&self) -> SandboxBackend {
        match self {
            Sandbox::Container(_) => SandboxBackend::Container,
            Sandbox::IsolatedVm(_) => SandboxBackend::IsolatedVm,
        }
    }
}

#[async_trait]
impl Formatter for Sandbox {
    async fn setup(
        &self,
        runner: &dyn CommandRunner,
        log: &ExecutionLog,
        images: &[String],
    ) -> Result<()> {
        match self {
            Sandbox::Container(f) => f.setup(runner, log, images).await,
            Sandbox::IsolatedVm(f) => f.setup(runner, log, images).await,
        }
    }

    async fn teardown(&self, runner: &dyn CommandRunner, log: &ExecutionLog) -> Result<()> {
        match self {
            Sandbox::Container(f) => f.teardown(runner, log).await,
            Sandbox::IsolatedVm(f) => f.teardown(runner, log).await,
        }
    }

    fn format_command(&self, command: &SandboxCommand) -> Vec<String> {
        match self {
            Sandbox::Container(f) => f.format_command(command),
            Sandbox::IsolatedVm(f) => f.format_command(command),
        }
    }
}
