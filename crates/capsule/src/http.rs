//! HTTP client for the worker's admin service.

use std::time::Duration;

use async_trait::async_trait;

use crate::admin::{
    CountResponse, DELETE_ALL_DATA_PATH, NUM_ACTIVE_TRACES_PATH,
    NUM_PENDING_COMPLETE_TRACES_PATH, RESET_ALL_CONFIG_PATH,
};
use crate::services::{ConfigService, ServiceError, TraceService};
use crate::version::CAPSULE_VERSION;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to one worker's admin endpoints. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkerHttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl WorkerHttpClient {
    /// Client for a worker listening on the loopback `ui_port`.
    pub fn for_port(ui_port: u16) -> Result<Self, ServiceError> {
        Self::new(format!("http://127.0.0.1:{ui_port}"))
    }

    pub fn new(base_url: impl Into<String>) -> Result<Self, ServiceError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let user_agent = format!("capsule/{}", CAPSULE_VERSION);
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_count(&self, path: &str) -> Result<u64, ServiceError> {
        let response = self.client.get(self.url(path)).send().await?;
        let response = check_status(response, path)?;
        let body: CountResponse = response.json().await?;
        Ok(body.count)
    }

    async fn post_empty(&self, path: &str) -> Result<(), ServiceError> {
        let response = self.client.post(self.url(path)).send().await?;
        check_status(response, path)?;
        Ok(())
    }
}

fn check_status(response: reqwest::Response, path: &str) -> Result<reqwest::Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    tracing::warn!(status = status.as_u16(), path, "Worker admin request failed");
    Err(ServiceError::Status {
        status: status.as_u16(),
        path: path.to_string(),
    })
}

#[async_trait]
impl TraceService for WorkerHttpClient {
    async fn num_pending_complete_traces(&self) -> Result<u64, ServiceError> {
        self.get_count(NUM_PENDING_COMPLETE_TRACES_PATH).await
    }

    async fn num_active_traces(&self) -> Result<u64, ServiceError> {
        self.get_count(NUM_ACTIVE_TRACES_PATH).await
    }

    async fn delete_all_snapshots(&self) -> Result<(), ServiceError> {
        self.post_empty(DELETE_ALL_DATA_PATH).await
    }
}

#[async_trait]
impl ConfigService for WorkerHttpClient {
    async fn reset_all_config(&self) -> Result<(), ServiceError> {
        self.post_empty(RESET_ALL_CONFIG_PATH).await
    }
}
