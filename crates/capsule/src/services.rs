//! Capabilities the container consumes from the worker's own service.
//!
//! The container only needs a handful of questions answered (is work still
//! pending, is anything active) and a couple of resets. How those travel is
//! the implementor's business; [`crate::http::WorkerHttpClient`] does it over
//! the worker's admin HTTP endpoints.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("worker service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("worker service returned {status} for {path}")]
    Status { status: u16, path: String },
    #[error("{0}")]
    Assertion(String),
}

#[async_trait]
pub trait TraceService: Send + Sync {
    /// Completed work not yet persisted by the worker.
    async fn num_pending_complete_traces(&self) -> Result<u64, ServiceError>;

    async fn num_active_traces(&self) -> Result<u64, ServiceError>;

    async fn delete_all_snapshots(&self) -> Result<(), ServiceError>;

    /// Fails with [`ServiceError::Assertion`] when anything is still running.
    async fn assert_no_active_traces(&self) -> Result<(), ServiceError> {
        match self.num_active_traces().await? {
            0 => Ok(()),
            n => Err(ServiceError::Assertion(format!(
                "There are {n} active traces"
            ))),
        }
    }
}

#[async_trait]
pub trait ConfigService: Send + Sync {
    async fn reset_all_config(&self) -> Result<(), ServiceError>;
}
