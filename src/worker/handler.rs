use std::sync::Arc;

use crate::config::{SandboxConfig, WorkerConfig};
use crate::error::{QueueError, Result};
use crate::queue::job::Job;
use crate::worker::client::WorkQueue;
use crate::worker::fetch::{clone_url, fetch_repository, token_forms, upload_url};
use crate::worker::idset::IdSet;
use crate::worker::logger::ExecutionLog;
use crate::worker::runner::CommandRunner;
use crate::worker::sandbox::{Formatter, Sandbox, SandboxCommand};

/// Settings the handler needs from the worker configuration.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub frontend_url: String,
    pub frontend_url_from_docker: String,
    pub auth_token: String,
    pub git_prefix: String,
    pub upload_route: String,
    pub upload_image: String,
    pub sandbox: SandboxConfig,
}

impl From<&WorkerConfig> for HandlerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            frontend_url: config.frontend_url.clone(),
            frontend_url_from_docker: config.frontend_url_from_docker.clone(),
            auth_token: config.auth_token.clone(),
            git_prefix: config.git_prefix.clone(),
            upload_route: config.upload_route.clone(),
            upload_image: config.upload_image.clone(),
            sandbox: config.sandbox.clone(),
        }
    }
}

/// Executes one indexing job end to end: fetch, sandboxed steps, upload.
pub struct IndexHandler {
    runner: Arc<dyn CommandRunner>,
    idset: IdSet,
    options: HandlerOptions,
    secrets: Vec<String>,
}

impl IndexHandler {
    pub fn new(runner: Arc<dyn CommandRunner>, idset: IdSet, options: HandlerOptions) -> Self {
        let secrets = token_forms(&options.auth_token);
        Self {
            runner,
            idset,
            options,
            secrets,
        }
    }

    pub fn idset(&self) -> &IdSet {
        &self.idset
    }

    /// Run `job`, then flush its execution log through `queue`.
    ///
    /// The log is flushed whatever the outcome. The job id is listed in the
    /// worker's heartbeats for as long as this call runs.
    pub async fn handle<Q>(&self, queue: &Q, job: &Job) -> Result<()>
    where
        Q: WorkQueue + ?Sized,
    {
        let _registration = self.idset.register(job.id);
        // Every secret interpolated into a host command must be listed here.
        let log = ExecutionLog::new(self.secrets.iter().cloned());

        tracing::info!(
            job_id = job.id,
            repository = %job.repository_name,
            commit = %job.commit,
            "Processing job"
        );
        let result = self.execute(&log, job).await;

        if let Err(e) = queue.set_log_contents(job.id, &log.contents()).await {
            tracing::warn!(job_id = job.id, error = %e, "Failed to upload log for job");
        }

        match &result {
            Ok(()) => tracing::info!(job_id = job.id, "Job succeeded"),
            Err(e) => tracing::warn!(job_id = job.id, error = %self.failure_message(e), "Job failed"),
        }
        result
    }

    /// The failure message reported for `err`, with secrets removed.
    pub fn failure_message(&self, err: &QueueError) -> String {
        ExecutionLog::new(self.secrets.iter().cloned()).redact(&err.to_string())
    }

    async fn execute(&self, log: &ExecutionLog, job: &Job) -> Result<()> {
        let runner = self.runner.as_ref();

        let url = clone_url(
            &self.options.frontend_url,
            &self.options.auth_token,
            &self.options.git_prefix,
            &job.repository_name,
        )?;
        // Removed when dropped at the end of this call.
        let repo_dir = fetch_repository(runner, log, &url, &job.commit).await?;

        let sandbox = Sandbox::new(&self.options.sandbox, repo_dir.path())?;
        let outcome = match sandbox.setup(runner, log, &self.images(job)).await {
            Ok(()) => self.run_steps(&sandbox, log, job).await,
            Err(e) => Err(e),
        };

        match (outcome, sandbox.teardown(runner, log).await) {
            (outcome, Ok(())) => outcome,
            (Ok(()), Err(teardown)) => Err(teardown),
            (Err(e), Err(teardown)) => Err(QueueError::append(Some(e), teardown)),
        }
    }

    /// Every image the job runs, in the order it runs them.
    fn images(&self, job: &Job) -> Vec<String> {
        let mut images = vec![self.options.upload_image.clone()];
        images.extend(job.steps.iter().map(|step| step.image.clone()));
        images.extend(indexer(job).map(str::to_string));
        images
    }

    async fn run_steps(&self, sandbox: &Sandbox, log: &ExecutionLog, job: &Job) -> Result<()> {
        let runner = self.runner.as_ref();

        for step in &job.steps {
            let mut command = SandboxCommand::new(step.image.as_str(), step.commands.iter().cloned())
                .with_workdir(step.root.as_str());
            command.env.extend(step.env.clone());

            runner
                .run(log, &sandbox.format_command(&command))
                .await
                .map_err(|e| e.context("failed to perform docker step"))?;
        }

        if let Some(image) = indexer(job) {
            let command = SandboxCommand::new(image, job.indexer_args.iter().cloned())
                .with_workdir(job.root.as_str());
            runner
                .run(log, &sandbox.format_command(&command))
                .await
                .map_err(|e| e.context("failed to index repository"))?;
        }

        let endpoint = upload_url(&self.options.frontend_url_from_docker, &self.options.auth_token)?;
        let upload = SandboxCommand::new(
            self.options.upload_image.as_str(),
            [
                "lsif",
                "upload",
                "-no-progress",
                "-repo",
                job.repository_name.as_str(),
                "-commit",
                job.commit.as_str(),
                "-upload-route",
                self.options.upload_route.as_str(),
                "-file",
                job.outfile(),
            ],
        )
        .with_workdir(job.root.as_str())
        .with_env("SRC_ENDPOINT", endpoint.as_str());

        runner
            .run(log, &sandbox.format_command(&upload))
            .await
            .map_err(|e| e.context("failed to upload index"))
    }
}

fn indexer(job: &Job) -> Option<&str> {
    job.indexer.as_deref().filter(|image| !image.is_empty())
}
