use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::config::SandboxConfig;
use crate::error::{QueueError, Result};
use crate::worker::logger::ExecutionLog;
use crate::worker::runner::CommandRunner;
use crate::worker::sandbox::container::ContainerFormatter;
use crate::worker::sandbox::{Formatter, SandboxCommand};

/// Where the job's source tree is copied inside the VM.
pub const VM_REPO_DIR: &str = "/repo-dir";

const IGNITE_FLAGS: [&str; 4] = ["--runtime", "docker", "--network-plugin", "docker-bridge"];

static IMAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([^:@]+)(?::([^@]+))?(?:@sha256:([a-z0-9]{64}))?")
        .expect("invalid image pattern")
});

/// Strip a `@sha256:<digest>` suffix from an image reference, keeping its tag.
///
/// ignite cannot parse digest-qualified references.
pub fn sanitize_image(image: &str) -> String {
    let Some(caps) = IMAGE_PATTERN.captures(image) else {
        return image.to_string();
    };
    let name = caps.get(1).map_or("", |m| m.as_str());
    match caps.get(2).map(|m| m.as_str()) {
        Some(tag) if !tag.is_empty() => format!("{}:{}", name, tag),
        _ => name.to_string(),
    }
}

/// File name of the `docker save` archive of `image` in the shared archive directory.
///
/// The full reference (digest included) is encoded: bytes outside
/// `[A-Za-z0-9.-]` become `_` plus two hex digits, so distinct references never
/// share an archive.
fn archive_name(image: &str) -> String {
    let mut stem = String::with_capacity(image.len());
    for byte in image.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{:02x}", byte));
        }
    }
    format!("{}.tar", stem)
}

fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

/// An image the VM needs, with its archive locations on the host and in the VM.
struct ImageArchive<'a> {
    image: &'a str,
    host_path: PathBuf,
    vm_path: String,
}

/// Runs every step of a job inside one firecracker VM managed by ignite.
#[derive(Debug, Clone)]
pub struct VmFormatter {
    name: String,
    repo_dir: String,
    vm_image: String,
    cpus: u32,
    memory: String,
    disk_space: String,
    archive_dir: PathBuf,
    inner: ContainerFormatter,
}

impl VmFormatter {
    pub fn new(
        name: impl Into<String>,
        repo_dir: impl Into<String>,
        config: &SandboxConfig,
    ) -> Result<Self> {
        let archive_dir = config.image_archive_path.clone().ok_or_else(|| {
            QueueError::Config("the vm backend requires an image archive path".to_string())
        })?;

        Ok(Self {
            name: name.into(),
            repo_dir: repo_dir.into(),
            vm_image: config.vm_image.clone(),
            cpus: config.cpus,
            memory: config.memory.clone(),
            disk_space: config.disk_space.clone(),
            archive_dir,
            inner: ContainerFormatter::new(VM_REPO_DIR, config),
        })
    }

    /// Name of the VM instance this job runs in.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn archives<'a>(&self, images: &'a [String]) -> Vec<ImageArchive<'a>> {
        let mut seen = std::collections::HashSet::new();
        images
            .iter()
            .filter(|image| seen.insert(*image))
            .enumerate()
            .map(|(i, image)| ImageArchive {
                image,
                host_path: self.archive_dir.join(archive_name(image)),
                vm_path: format!("/image{}.tar", i),
            })
            .collect()
    }

    async fn save_image(
        &self,
        runner: &dyn CommandRunner,
        log: &ExecutionLog,
        archive: &ImageArchive<'_>,
    ) -> Result<()> {
        if tokio::fs::try_exists(&archive.host_path).await? {
            tracing::debug!(image = archive.image, "Image archive already present");
            return Ok(());
        }

        runner
            .run(log, &argv(["docker", "pull", archive.image]))
            .await
            .map_err(|e| e.context(format!("failed to pull {}", archive.image)))?;

        // Concurrent jobs may save the same image; only a complete archive is
        // ever visible under the final name.
        let partial = partial_path(&archive.host_path, &self.name);
        runner
            .run(
                log,
                &argv([
                    "docker".to_string(),
                    "save".to_string(),
                    "-o".to_string(),
                    partial.to_string_lossy().into_owned(),
                    archive.image.to_string(),
                ]),
            )
            .await
            .map_err(|e| e.context(format!("failed to save {}", archive.image)))?;

        tokio::fs::rename(&partial, &archive.host_path)
            .await
            .map_err(|e| QueueError::from(e).context(format!("failed to save {}", archive.image)))
    }

    fn start_command(&self, archives: &[ImageArchive<'_>]) -> Vec<String> {
        let mut command = argv(["ignite", "run"]);
        command.extend(argv(IGNITE_FLAGS));
        command.extend(argv([
            "--cpus".to_string(),
            self.cpus.to_string(),
            "--memory".to_string(),
            self.memory.clone(),
            "--size".to_string(),
            self.disk_space.clone(),
        ]));

        command.push("--copy-files".to_string());
        command.push(format!("{}:{}", self.repo_dir, VM_REPO_DIR));
        for archive in archives {
            command.push("--copy-files".to_string());
            command.push(format!("{}:{}", archive.host_path.display(), archive.vm_path));
        }

        command.push("--ssh".to_string());
        command.push("--name".to_string());
        command.push(self.name.clone());
        command.push(sanitize_image(&self.vm_image));
        command
    }

    fn exec_command<I, S>(&self, inner: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = argv(["ignite", "exec"]);
        command.push(self.name.clone());
        command.push("--".to_string());
        command.extend(argv(inner));
        command
    }
}

fn partial_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.partial", suffix));
    path.with_file_name(name)
}

#[async_trait]
impl Formatter for VmFormatter {
    async fn setup(
        &self,
        runner: &dyn CommandRunner,
        log: &ExecutionLog,
        images: &[String],
    ) -> Result<()> {
        let archives = self.archives(images);
        for archive in &archives {
            self.save_image(runner, log, archive).await?;
        }

        runner
            .run(log, &self.start_command(&archives))
            .await
            .map_err(|e| e.context("failed to start firecracker vm"))?;
        tracing::info!(vm = %self.name, images = archives.len(), "Started job VM");

        for archive in &archives {
            runner
                .run(log, &self.exec_command(["docker", "load", "-i", archive.vm_path.as_str()]))
                .await
                .map_err(|e| e.context(format!("failed to load {}", archive.image)))?;
        }

        // Free the VM's scratch space.
        for archive in &archives {
            runner
                .run(log, &self.exec_command(["rm", archive.vm_path.as_str()]))
                .await
                .map_err(|e| e.context(format!("failed to remove tarfile for {}", archive.image)))?;
        }

        Ok(())
    }

    async fn teardown(&self, runner: &dyn CommandRunner, log: &ExecutionLog) -> Result<()> {
        let mut stop = argv(["ignite", "stop"]);
        stop.extend(argv(IGNITE_FLAGS));
        stop.push(self.name.clone());
        if let Err(e) = runner.run(log, &stop).await {
            tracing::warn!(vm = %self.name, error = %e, "Failed to stop firecracker vm");
        }

        let mut remove = argv(["ignite", "rm", "-f"]);
        remove.extend(argv(IGNITE_FLAGS));
        remove.push(self.name.clone());
        if let Err(e) = runner.run(log, &remove).await {
            tracing::warn!(vm = %self.name, error = %e, "Failed to remove firecracker vm");
        }

        Ok(())
    }

    fn format_command(&self, command: &SandboxCommand) -> Vec<String> {
        self.exec_command(self.inner.format_command(command))
    }
}
