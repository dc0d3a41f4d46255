//! Core types for asynchronous generation jobs.

use crate::error::{ReelWatchError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Status of an asynchronous job.
///
/// `Completed` and `Failed` are terminal: once observed, the remote service
/// never reports another status for the same handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Accepted by the service, not yet scheduled.
    Submitted,
    /// Generation is running.
    InProgress,
    /// Generation finished and the artifact was written to the output location.
    Completed,
    /// Generation failed; see the job's failure message.
    Failed,
}

impl JobStatus {
    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns the wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "Submitted",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ReelWatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Submitted" => Ok(Self::Submitted),
            "InProgress" => Ok(Self::InProgress),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            other => Err(ReelWatchError::UnexpectedResponse(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// S3 destination of a job's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3OutputDataConfig {
    /// `s3://bucket[/prefix]` URI the service writes into.
    pub s3_uri: String,
}

/// Where the remote service will place the generated artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDataConfig {
    /// S3 output settings.
    pub s3_output_data_config: S3OutputDataConfig,
}

impl OutputDataConfig {
    /// Creates an output config pointing at the given `s3://` URI.
    pub fn s3(uri: impl Into<String>) -> Self {
        Self {
            s3_output_data_config: S3OutputDataConfig { s3_uri: uri.into() },
        }
    }

    /// Parses the bucket and key prefix out of the output URI.
    pub fn location(&self) -> Result<S3Location> {
        S3Location::parse(&self.s3_output_data_config.s3_uri)
    }
}

/// A parsed `s3://bucket/prefix` location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    /// Bucket name.
    pub bucket: String,
    /// Key prefix without leading or trailing slashes (may be empty).
    pub prefix: String,
}

impl S3Location {
    /// Parses an `s3://` URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri.strip_prefix("s3://").ok_or_else(|| {
            ReelWatchError::InvalidRequest(format!("not an s3:// URI: {uri}"))
        })?;
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(ReelWatchError::InvalidRequest(format!(
                "missing bucket in URI: {uri}"
            )));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        })
    }

    /// Key prefix under which the service writes the outputs of `job_id`.
    pub fn job_prefix(&self, job_id: &str) -> String {
        if self.prefix.is_empty() {
            job_id.to_string()
        } else {
            format!("{}/{}", self.prefix, job_id)
        }
    }
}

/// Snapshot of an asynchronous job as reported by the remote service.
///
/// Serializes with the service's camelCase field names so that the
/// `completed.json` / `failed.json` snapshots mirror the status response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Opaque job handle (an invocation ARN).
    pub invocation_arn: String,
    /// Model that runs the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_arn: Option<String>,
    /// Current status.
    pub status: JobStatus,
    /// When the job was submitted.
    pub submit_time: DateTime<Utc>,
    /// Last status change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_time: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Reason reported for a failed job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    /// Remote output location.
    pub output_data_config: OutputDataConfig,
}

impl Job {
    /// Creates a job snapshot with the minimum set of attributes.
    pub fn new(
        invocation_arn: impl Into<String>,
        status: JobStatus,
        submit_time: DateTime<Utc>,
        output_uri: impl Into<String>,
    ) -> Self {
        Self {
            invocation_arn: invocation_arn.into(),
            model_arn: None,
            status,
            submit_time,
            last_modified_time: None,
            end_time: None,
            failure_message: None,
            output_data_config: OutputDataConfig::s3(output_uri),
        }
    }

    /// Trailing path segment of the handle.
    pub fn job_id(&self) -> &str {
        job_id_from_arn(&self.invocation_arn)
    }

    /// Time spent so far: end minus submit when finished, now minus submit otherwise.
    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Utc::now())
    }

    /// Like [`Job::elapsed`], measured against `now` for unfinished jobs.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        let end = self.end_time.unwrap_or(now);
        (end - self.submit_time).to_std().unwrap_or_default()
    }
}

/// Extracts the job id (trailing `/` segment) from an invocation ARN.
pub fn job_id_from_arn(invocation_arn: &str) -> &str {
    invocation_arn.rsplit('/').next().unwrap_or(invocation_arn)
}

/// Immediate acknowledgement of a job submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    /// Handle of the newly created job.
    pub invocation_arn: String,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    /// Only jobs in this status.
    pub status_equals: Option<JobStatus>,
    /// Only jobs submitted after this instant.
    pub submit_time_after: Option<DateTime<Utc>>,
    /// Cap on the number of jobs returned.
    pub max_results: Option<i32>,
}

impl JobFilter {
    /// Creates a filter matching jobs in `status`.
    pub fn status(status: JobStatus) -> Self {
        Self {
            status_equals: Some(status),
            ..Self::default()
        }
    }

    /// Restricts the filter to jobs submitted after `after`.
    pub fn submitted_after(mut self, after: DateTime<Utc>) -> Self {
        self.submit_time_after = Some(after);
        self
    }

    /// Caps the number of jobs returned.
    pub fn with_max_results(mut self, max: i32) -> Self {
        self.max_results = Some(max);
        self
    }

    /// Returns true if `job` satisfies this filter.
    pub fn matches(&self, job: &Job) -> bool {
        self.status_equals.is_none_or(|s| s == job.status)
            && self.submit_time_after.is_none_or(|t| job.submit_time > t)
    }
}

/// A downloaded artifact and the job that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Handle of the producing job.
    pub invocation_arn: String,
    /// Local path of the artifact.
    pub path: PathBuf,
}

/// Outcome of driving one job to a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The artifact was downloaded by this call.
    Downloaded(ArtifactRecord),
    /// The artifact was already on disk from a previous run.
    AlreadyDownloaded(ArtifactRecord),
    /// The job failed remotely.
    Failed {
        /// Failure message reported by the service.
        message: Option<String>,
    },
    /// The job completed but no artifact was found in the output location.
    ArtifactMissing,
}

impl JobOutcome {
    /// Local artifact path, if the job produced one.
    pub fn artifact_path(&self) -> Option<&std::path::Path> {
        match self {
            Self::Downloaded(record) | Self::AlreadyDownloaded(record) => Some(&record.path),
            Self::Failed { .. } | Self::ArtifactMissing => None,
        }
    }
}
