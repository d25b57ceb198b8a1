use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use url::Url;

use crate::error::{QueueError, Result};
use crate::protocol::{
    CompleteRequest, DequeueRequest, HeartbeatRequest, SetLogRequest, COMPLETE_ROUTE,
    DEQUEUE_ROUTE, HEARTBEAT_ROUTE, SET_LOG_ROUTE,
};
use crate::queue::job::Job;
use crate::worker::fetch::AUTH_USER;

/// The worker's view of the lease manager.
///
/// Implementations identify the worker themselves; callers only pass job ids.
#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    /// Lease the next job, if any is ready.
    async fn dequeue(&self) -> Result<Option<Job>>;

    async fn set_log_contents(&self, job_id: i64, contents: &str) -> Result<()>;

    /// Report the job's outcome. `None` marks success.
    async fn complete(&self, job_id: i64, error_message: Option<&str>) -> Result<()>;

    /// Report every job this worker is still processing.
    async fn heartbeat(&self, job_ids: &[i64]) -> Result<()>;
}

/// HTTP client of the lease manager API.
#[derive(Debug, Clone)]
pub struct QueueClient {
    http: reqwest::Client,
    base_url: Url,
    worker_name: String,
    auth_token: String,
}

impl QueueClient {
    /// `base_url` includes the manager's route prefix.
    pub fn new(
        base_url: &str,
        worker_name: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(env!("CARGO_PKG_NAME"))
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            worker_name: worker_name.into(),
            auth_token: auth_token.into(),
        })
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    fn endpoint(&self, route: &str) -> Url {
        let mut url = self.base_url.clone();
        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            route.trim_start_matches('/')
        );
        url.set_path(&path);
        url
    }

    async fn post<B: Serialize + ?Sized>(&self, route: &str, body: &B) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.endpoint(route))
            .basic_auth(AUTH_USER, Some(&self.auth_token))
            .json(body)
            .send()
            .await?;
        Ok(response)
    }

    /// Post and require an empty `204` reply.
    async fn post_no_content<B: Serialize + ?Sized>(&self, route: &str, body: &B) -> Result<()> {
        let response = self.post(route, body).await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            status => Err(QueueError::UnexpectedStatus(status.as_u16())),
        }
    }
}

#[async_trait]
impl WorkQueue for QueueClient {
    async fn dequeue(&self) -> Result<Option<Job>> {
        let body = DequeueRequest {
            indexer_name: self.worker_name.clone(),
        };
        let response = self.post(DEQUEUE_ROUTE, &body).await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.json::<Job>().await?)),
            StatusCode::NO_CONTENT => Ok(None),
            status => Err(QueueError::UnexpectedStatus(status.as_u16())),
        }
    }

    async fn set_log_contents(&self, job_id: i64, contents: &str) -> Result<()> {
        let body = SetLogRequest {
            indexer_name: self.worker_name.clone(),
            index_id: job_id,
            contents: contents.to_string(),
        };
        self.post_no_content(SET_LOG_ROUTE, &body).await
    }

    async fn complete(&self, job_id: i64, error_message: Option<&str>) -> Result<()> {
        let body = CompleteRequest {
            indexer_name: self.worker_name.clone(),
            index_id: job_id,
            error_message: error_message.map(str::to_string),
        };
        let response = self.post(COMPLETE_ROUTE, &body).await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                tracing::warn!(job_id, "Manager no longer holds the job, completion dropped");
                Ok(())
            }
            status => Err(QueueError::UnexpectedStatus(status.as_u16())),
        }
    }

    async fn heartbeat(&self, job_ids: &[i64]) -> Result<()> {
        let body = HeartbeatRequest {
            indexer_name: self.worker_name.clone(),
            index_ids: job_ids.to_vec(),
        };
        self.post_no_content(HEARTBEAT_ROUTE, &body).await
    }
}
