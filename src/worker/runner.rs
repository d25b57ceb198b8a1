use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::error::{QueueError, Result};
use crate::worker::logger::ExecutionLog;

/// Runs external commands on the host, recording them in the job's log.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` (program followed by its arguments) to completion.
    /// A non-zero exit status is an error.
    async fn run(&self, log: &ExecutionLog, command: &[String]) -> Result<()>;
}

/// Spawns real child processes.
///
/// Children are killed if the future running them is dropped, so cancelling a
/// job never leaves a process behind.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, log: &ExecutionLog, command: &[String]) -> Result<()> {
        let shown = log.redact(&command.join(" "));
        let Some((program, args)) = command.split_first() else {
            return Err(QueueError::Command {
                command: shown,
                reason: "empty command".to_string(),
            });
        };

        tracing::debug!(command = %shown, "Running command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| QueueError::Command {
                command: shown.clone(),
                reason: e.to_string(),
            })?;

        let output = Mutex::new(String::new());
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::join!(
            capture_lines("stdout", stdout, &output),
            capture_lines("stderr", stderr, &output),
        );
        let status = child.wait().await;

        let output = output
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        log.record(command, output);

        let status = status.map_err(|e| QueueError::Command {
            command: shown.clone(),
            reason: e.to_string(),
        })?;
        if !status.success() {
            return Err(QueueError::Command {
                command: shown,
                reason: status.to_string(),
            });
        }
        Ok(())
    }
}

/// Append every line of `stream` to `out` as `<prefix>: <line>`.
async fn capture_lines<R>(prefix: &str, stream: Option<R>, out: &Mutex<String>)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else { return };
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let mut out = out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                out.push_str(prefix);
                out.push_str(": ");
                out.push_str(&line);
                out.push('\n');
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(stream = prefix, error = %e, "Failed to read command output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn captures_both_streams() {
        let log = ExecutionLog::new(Vec::<String>::new());
        ProcessRunner
            .run(&log, &argv(&["sh", "-c", "echo out; echo err 1>&2"]))
            .await
            .unwrap();

        let contents = log.contents();
        assert!(contents.starts_with("sh -c echo out; echo err 1>&2\n"));
        assert!(contents.contains("stdout: out\n"));
        assert!(contents.contains("stderr: err\n"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error_and_still_logged() {
        let log = ExecutionLog::new(["s3cret"]);
        let err = ProcessRunner
            .run(&log, &argv(&["sh", "-c", "echo s3cret; exit 3"]))
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::Command { .. }));
        assert!(!err.to_string().contains("s3cret"));
        assert_eq!(log.len(), 1);
        assert!(log.contents().contains("stdout: ******"));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let log = ExecutionLog::default();
        assert!(ProcessRunner.run(&log, &[]).await.is_err());
        assert!(log.is_empty());
    }
}
