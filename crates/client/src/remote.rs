//! Remote job API consumed by the sync engine.
//!
//! Each mutation endpoint only has to report success or failure; no response
//! body is needed for replay correctness. Every mutation carries the action id
//! as an idempotency key so the server can discard a replay it has already
//! applied (e.g. when the response to the first attempt was lost).

use std::time::Duration;

use async_trait::async_trait;
use fieldsync_core::{ActionId, Job, JobId, JobStatus, PhotoRecord};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::json;

/// Header carrying the action id on mutation requests.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("API error ({0}): {1}")]
    Api(u16, String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl RemoteError {
    /// Transport-level failure (the request may not have reached the server).
    pub fn is_network(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }
}

/// Remote operations on jobs.
#[async_trait]
pub trait RemoteJobApi: Send + Sync {
    async fn accept_job(&self, key: ActionId, job: &JobId) -> Result<(), RemoteError>;

    async fn update_status(&self, key: ActionId, job: &JobId, status: JobStatus) -> Result<(), RemoteError>;

    async fn add_photo(&self, key: ActionId, job: &JobId, photo: &PhotoRecord) -> Result<(), RemoteError>;

    /// Jobs open for acceptance.
    async fn list_available_jobs(&self) -> Result<Vec<Job>, RemoteError>;

    /// Jobs assigned to the authenticated worker.
    async fn list_my_jobs(&self) -> Result<Vec<Job>, RemoteError>;

    /// Cheap reachability probe.
    async fn check_connectivity(&self) -> bool;
}

/// `RemoteJobApi` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemoteApi {
    client: Client,
    api_url: String,
    token: Option<String>,
}

impl HttpRemoteApi {
    pub fn new(api_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn job_url(&self, job: &JobId, suffix: &str) -> String {
        self.url(&format!("/jobs/{}/{}", job, suffix))
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, RemoteError> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(RemoteError::Api(status, resp.text().await.unwrap_or_default()));
        }

        Ok(resp)
    }

    async fn mutate(&self, key: ActionId, req: RequestBuilder) -> Result<(), RemoteError> {
        self.send(req.header(IDEMPOTENCY_HEADER, key.to_string())).await?;
        Ok(())
    }

    async fn fetch_jobs(&self, path: &str) -> Result<Vec<Job>, RemoteError> {
        let resp = self.send(self.client.get(self.url(path))).await?;
        resp.json().await.map_err(|e| RemoteError::Parse(e.to_string()))
    }
}

#[async_trait]
impl RemoteJobApi for HttpRemoteApi {
    async fn accept_job(&self, key: ActionId, job: &JobId) -> Result<(), RemoteError> {
        self.mutate(key, self.client.post(self.job_url(job, "accept"))).await
    }

    async fn update_status(&self, key: ActionId, job: &JobId, status: JobStatus) -> Result<(), RemoteError> {
        let req = self
            .client
            .patch(self.job_url(job, "status"))
            .json(&json!({ "status": status }));
        self.mutate(key, req).await
    }

    async fn add_photo(&self, key: ActionId, job: &JobId, photo: &PhotoRecord) -> Result<(), RemoteError> {
        let req = self.client.post(self.job_url(job, "photos")).json(photo);
        self.mutate(key, req).await
    }

    async fn list_available_jobs(&self) -> Result<Vec<Job>, RemoteError> {
        self.fetch_jobs("/jobs/available").await
    }

    async fn list_my_jobs(&self) -> Result<Vec<Job>, RemoteError> {
        self.fetch_jobs("/jobs/mine").await
    }

    /// Check connectivity by hitting the health endpoint.
    async fn check_connectivity(&self) -> bool {
        match self.client.get(self.url("/health")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::debug!(error = %err, "health check failed");
                false
            }
        }
    }
}
