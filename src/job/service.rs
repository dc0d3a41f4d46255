//! Remote service traits and retry utilities.

use crate::error::Result;
use crate::job::types::{Job, JobFilter, Submission};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// A remote service that runs asynchronous generation jobs.
#[async_trait]
pub trait JobService: Send + Sync {
    /// Submits a job and returns its handle.
    async fn submit(
        &self,
        model_id: &str,
        model_input: &serde_json::Value,
        output_uri: &str,
    ) -> Result<Submission>;

    /// Fetches the current state of a job.
    async fn get(&self, handle: &str) -> Result<Job>;

    /// Lists jobs matching `filter`.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Returns the name of this service for display.
    fn name(&self) -> &str;
}

/// Extension trait for services with retry logic.
#[async_trait]
pub trait JobServiceExt: JobService {
    /// Submits with automatic retries on throttling and transient failures.
    ///
    /// Throttled attempts wait `backoff` unless the service suggested a delay.
    /// After `max_retries` retries the last error is returned.
    async fn submit_with_retries(
        &self,
        model_id: &str,
        model_input: &serde_json::Value,
        output_uri: &str,
        max_retries: u32,
        backoff: Duration,
    ) -> Result<Submission> {
        let mut attempt = 0;
        loop {
            match self.submit(model_id, model_input, output_uri).await {
                Ok(submission) => return Ok(submission),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    let delay = e.retry_after().unwrap_or(backoff);
                    tracing::warn!(
                        attempt,
                        max_retries,
                        delay_secs = delay.as_secs(),
                        "retrying submission after transient error: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<T: JobService + ?Sized> JobServiceExt for T {}

/// Object storage holding job artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists the keys in `bucket` that start with `prefix`.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Downloads one object to `dest`, returning the number of bytes written.
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64>;
}
