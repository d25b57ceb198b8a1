use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::worker::logger::ExecutionLog;
use crate::worker::runner::CommandRunner;
use crate::worker::sandbox::{Formatter, SandboxCommand};

/// Mount point of the job's source tree inside step containers.
pub const CONTAINER_DATA_DIR: &str = "/data";

/// Runs each step with `docker run`, bind-mounting the source tree.
#[derive(Debug, Clone)]
pub struct ContainerFormatter {
    repo_dir: String,
    cpus: u32,
    memory: String,
}

impl ContainerFormatter {
    pub fn new(repo_dir: impl Into<String>, config: &SandboxConfig) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            cpus: config.cpus,
            memory: config.memory.clone(),
        }
    }

    fn workdir(&self, relative: &str) -> String {
        let relative = relative.trim_matches('/');
        if relative.is_empty() || relative == "." {
            CONTAINER_DATA_DIR.to_string()
        } else {
            format!("{}/{}", CONTAINER_DATA_DIR, relative)
        }
    }
}

#[async_trait]
impl Formatter for ContainerFormatter {
    async fn setup(
        &self,
        _runner: &dyn CommandRunner,
        _log: &ExecutionLog,
        _images: &[String],
    ) -> Result<()> {
        Ok(())
    }

    async fn teardown(&self, _runner: &dyn CommandRunner, _log: &ExecutionLog) -> Result<()> {
        Ok(())
    }

    fn format_command(&self, command: &SandboxCommand) -> Vec<String> {
        let mut argv = vec![
            "docker".to_string(),
            "run".to_string(),
            "--rm".to_string(),
            "--cpus".to_string(),
            self.cpus.to_string(),
            "--memory".to_string(),
            self.memory.clone(),
            "-v".to_string(),
            format!("{}:{}", self.repo_dir, CONTAINER_DATA_DIR),
            "-w".to_string(),
            self.workdir(&command.workdir),
        ];

        // BTreeMap iteration keeps the env flags in key order.
        for (key, value) in &command.env {
            argv.push("-e".to_string());
            argv.push(format!("{}={}", key, value));
        }

        argv.push(command.image.clone());
        argv.extend(command.args.iter().cloned());
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatter() -> ContainerFormatter {
        ContainerFormatter::new("/tmp/job-1", &SandboxConfig::container())
    }

    #[test]
    fn renders_docker_run() {
        let cmd = SandboxCommand::new("alpine:3", ["ls", "-la"])
            .with_workdir("sub/dir")
            .with_env("B", "2")
            .with_env("A", "1");

        assert_eq!(
            formatter().format_command(&cmd),
            vec![
                "docker", "run", "--rm", "--cpus", "4", "--memory", "12G", "-v",
                "/tmp/job-1:/data", "-w", "/data/sub/dir", "-e", "A=1", "-e", "B=2",
                "alpine:3", "ls", "-la",
            ]
        );
    }

    #[test]
    fn empty_workdir_is_the_mount_root() {
        let f = formatter();
        assert_eq!(f.workdir(""), "/data");
        assert_eq!(f.workdir("/"), "/data");
        assert_eq!(f.workdir("."), "/data");
        assert_eq!(f.workdir("/pkg/"), "/data/pkg");
    }

    #[test]
    fn argument_with_spaces_stays_one_element() {
        let cmd = SandboxCommand::new("alpine", ["sh", "-c", "echo a b"]);
        let argv = formatter().format_command(&cmd);
        assert_eq!(argv.last().map(String::as_str), Some("echo a b"));
    }
}
