//! Amazon Bedrock async-invoke job service.

use super::{load_sdk_config, sdk_error, to_chrono, to_document, to_smithy};
use crate::error::{ReelWatchError, Result};
use crate::job::service::JobService;
use crate::job::types::{Job, JobFilter, JobStatus, OutputDataConfig, Submission};
use async_trait::async_trait;
use aws_sdk_bedrockruntime::types::{
    AsyncInvokeOutputDataConfig, AsyncInvokeS3OutputDataConfig, AsyncInvokeStatus,
};
use aws_sdk_bedrockruntime::Client;
use aws_smithy_types::DateTime as SmithyDateTime;

/// Builder for BedrockJobService.
#[derive(Debug, Clone, Default)]
pub struct BedrockJobServiceBuilder {
    region: Option<String>,
    sdk_config: Option<aws_config::SdkConfig>,
}

impl BedrockJobServiceBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the AWS region. Falls back to the SDK's region chain, then `us-east-1`.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Reuses an already loaded SDK configuration (shared with the S3 store).
    pub fn sdk_config(mut self, config: aws_config::SdkConfig) -> Self {
        self.sdk_config = Some(config);
        self
    }

    /// Builds the service, loading credentials and region when no config was given.
    pub async fn build(self) -> Result<BedrockJobService> {
        let config = match self.sdk_config {
            Some(config) => config,
            None => load_sdk_config(self.region).await,
        };
        let region = config
            .region()
            .map(|r| r.to_string())
            .ok_or_else(|| ReelWatchError::InvalidRequest("no AWS region configured".into()))?;

        Ok(BedrockJobService {
            client: Client::new(&config),
            region,
        })
    }
}

/// Bedrock runtime client for `StartAsyncInvoke` / `GetAsyncInvoke` / `ListAsyncInvokes`.
#[derive(Debug, Clone)]
pub struct BedrockJobService {
    client: Client,
    region: String,
}

impl BedrockJobService {
    /// Creates a new `BedrockJobServiceBuilder`.
    pub fn builder() -> BedrockJobServiceBuilder {
        BedrockJobServiceBuilder::new()
    }

    /// Region the client talks to.
    pub fn region(&self) -> &str {
        &self.region
    }
}

/// Borrowed view over the fields shared by `GetAsyncInvokeOutput` and
/// `AsyncInvokeSummary`.
struct InvokeView<'a> {
    invocation_arn: Option<&'a str>,
    model_arn: Option<&'a str>,
    status: Option<&'a AsyncInvokeStatus>,
    submit_time: Option<&'a SmithyDateTime>,
    last_modified_time: Option<&'a SmithyDateTime>,
    end_time: Option<&'a SmithyDateTime>,
    failure_message: Option<&'a str>,
    output_data_config: Option<&'a AsyncInvokeOutputDataConfig>,
}

macro_rules! invoke_view {
    ($src:expr) => {{
        let src = $src;
        InvokeView {
            invocation_arn: src.invocation_arn().into(),
            model_arn: src.model_arn().into(),
            status: src.status().into(),
            submit_time: src.submit_time().into(),
            last_modified_time: src.last_modified_time().into(),
            end_time: src.end_time().into(),
            failure_message: src.failure_message().into(),
            output_data_config: src.output_data_config().into(),
        }
    }};
}

impl InvokeView<'_> {
    fn into_job(self) -> Result<Job> {
        let invocation_arn = self
            .invocation_arn
            .ok_or_else(|| ReelWatchError::UnexpectedResponse("missing invocationArn".into()))?;
        let status = self
            .status
            .map(map_status)
            .transpose()?
            .ok_or_else(|| missing(invocation_arn, "status"))?;
        let submit_time = self
            .submit_time
            .and_then(to_chrono)
            .ok_or_else(|| missing(invocation_arn, "submitTime"))?;
        let s3_uri = match self.output_data_config {
            Some(AsyncInvokeOutputDataConfig::S3OutputDataConfig(s3)) => {
                let uri: Option<&str> = s3.s3_uri().into();
                uri.map(str::to_owned)
            }
            _ => None,
        }
        .ok_or_else(|| missing(invocation_arn, "outputDataConfig.s3OutputDataConfig"))?;

        Ok(Job {
            invocation_arn: invocation_arn.to_string(),
            model_arn: self.model_arn.map(str::to_owned),
            status,
            submit_time,
            last_modified_time: self.last_modified_time.and_then(to_chrono),
            end_time: self.end_time.and_then(to_chrono),
            failure_message: self.failure_message.map(str::to_owned),
            output_data_config: OutputDataConfig::s3(s3_uri),
        })
    }
}

fn missing(invocation_arn: &str, field: &str) -> ReelWatchError {
    ReelWatchError::UnexpectedResponse(format!("job {invocation_arn} has no {field}"))
}

fn map_status(status: &AsyncInvokeStatus) -> Result<JobStatus> {
    match status {
        AsyncInvokeStatus::InProgress => Ok(JobStatus::InProgress),
        AsyncInvokeStatus::Completed => Ok(JobStatus::Completed),
        AsyncInvokeStatus::Failed => Ok(JobStatus::Failed),
        other => other.as_str().parse(),
    }
}

fn to_sdk_status(status: JobStatus) -> AsyncInvokeStatus {
    AsyncInvokeStatus::from(status.as_str())
}

#[async_trait]
impl JobService for BedrockJobService {
    async fn submit(
        &self,
        model_id: &str,
        model_input: &serde_json::Value,
        output_uri: &str,
    ) -> Result<Submission> {
        let s3 = AsyncInvokeS3OutputDataConfig::builder()
            .s3_uri(output_uri)
            .build()
            .map_err(|e| ReelWatchError::InvalidRequest(e.to_string()))?;

        let output = self
            .client
            .start_async_invoke()
            .model_id(model_id)
            .model_input(to_document(model_input))
            .output_data_config(AsyncInvokeOutputDataConfig::S3OutputDataConfig(s3))
            .send()
            .await
            .map_err(|e| sdk_error("StartAsyncInvoke", e))?;

        let invocation_arn: Option<&str> = output.invocation_arn().into();
        let invocation_arn = invocation_arn.ok_or_else(|| {
            ReelWatchError::UnexpectedResponse("StartAsyncInvoke returned no invocationArn".into())
        })?;
        tracing::debug!(model_id, invocation_arn, "submitted async invoke");

        Ok(Submission {
            invocation_arn: invocation_arn.to_string(),
        })
    }

    async fn get(&self, handle: &str) -> Result<Job> {
        let output = self
            .client
            .get_async_invoke()
            .invocation_arn(handle)
            .send()
            .await
            .map_err(|e| sdk_error("GetAsyncInvoke", e))?;

        invoke_view!(&output).into_job()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_async_invokes()
                .set_next_token(next_token.take());
            if let Some(status) = filter.status_equals {
                request = request.status_equals(to_sdk_status(status));
            }
            if let Some(after) = &filter.submit_time_after {
                request = request.submit_time_after(to_smithy(after));
            }
            if let Some(max) = filter.max_results {
                request = request.max_results(max);
            }

            let output = request
                .send()
                .await
                .map_err(|e| sdk_error("ListAsyncInvokes", e))?;

            for summary in output.async_invoke_summaries() {
                jobs.push(invoke_view!(summary).into_job()?);
            }

            let want_more = filter
                .max_results
                .is_none_or(|max| (jobs.len() as i64) < i64::from(max));
            match output.next_token() {
                Some(token) if want_more => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        if let Some(max) = filter.max_results {
            jobs.truncate(max.max(0) as usize);
        }
        tracing::debug!(count = jobs.len(), status = ?filter.status_equals, "listed async invokes");
        Ok(jobs)
    }

    fn name(&self) -> &str {
        "Amazon Bedrock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_config::{BehaviorVersion, Region};

    #[test]
    fn test_map_status() {
        assert_eq!(
            map_status(&AsyncInvokeStatus::InProgress).unwrap(),
            JobStatus::InProgress
        );
        assert_eq!(
            map_status(&AsyncInvokeStatus::Completed).unwrap(),
            JobStatus::Completed
        );
        assert_eq!(map_status(&AsyncInvokeStatus::Failed).unwrap(), JobStatus::Failed);
        assert!(map_status(&AsyncInvokeStatus::from("Exploded")).is_err());
    }

    #[test]
    fn test_to_sdk_status_round_trips_wire_names() {
        for status in [JobStatus::InProgress, JobStatus::Completed, JobStatus::Failed] {
            assert_eq!(to_sdk_status(status).as_str(), status.as_str());
        }
    }

    #[tokio::test]
    async fn test_builder_with_explicit_config() {
        let config = aws_config::SdkConfig::builder()
            .region(Region::new("us-west-2"))
            .behavior_version(BehaviorVersion::latest())
            .build();
        let service = BedrockJobService::builder()
            .sdk_config(config)
            .build()
            .await
            .unwrap();
        assert_eq!(service.region(), "us-west-2");
        assert_eq!(service.name(), "Amazon Bedrock");
    }

    #[tokio::test]
    async fn test_builder_without_region_fails() {
        let config = aws_config::SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .build();
        let result = BedrockJobService::builder().sdk_config(config).build().await;
        assert!(matches!(result, Err(ReelWatchError::InvalidRequest(_))));
    }
}
