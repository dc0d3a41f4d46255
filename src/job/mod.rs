//! Asynchronous job model and remote service interfaces.

#[cfg(feature = "bedrock")]
pub mod providers;
mod service;
#[cfg(test)]
pub(crate) mod testing;
mod types;

pub use service::{JobService, JobServiceExt, ObjectStore};
pub use types::{
    job_id_from_arn, ArtifactRecord, Job, JobFilter, JobOutcome, JobStatus, OutputDataConfig,
    S3Location, S3OutputDataConfig, Submission,
};
