#![warn(missing_docs)]
//! reelwatch - submit, monitor and download asynchronous generative-video jobs.
//!
//! A job is submitted to a remote model service, which answers with an opaque
//! handle and writes the finished artifact to object storage. [`JobMonitor`]
//! polls the handle until the job is terminal, downloads the artifact into a
//! per-job folder and records a JSON snapshot of the outcome. Every step is
//! idempotent: running the monitor again never downloads or rewrites what is
//! already on disk.
//!
//! # Quick Start
//!
//! ```no_run
//! use reelwatch::providers::{load_sdk_config, BedrockJobService, S3ObjectStore};
//! use reelwatch::{JobMonitor, VideoGenerationRequest, DEFAULT_MODEL_ID};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> reelwatch::Result<()> {
//!     let config = load_sdk_config(None).await;
//!     let service = BedrockJobService::builder().sdk_config(config.clone()).build().await?;
//!     let monitor = JobMonitor::builder(Arc::new(service), Arc::new(S3ObjectStore::new(&config)))
//!         .output_dir("output")
//!         .build();
//!
//!     let input = VideoGenerationRequest::new("Ocean waves crashing on a rocky shore")
//!         .to_model_input()?;
//!     let job = monitor
//!         .start_job(DEFAULT_MODEL_ID, &input, "s3://my-video-bucket")
//!         .await?;
//!     let outcome = monitor.monitor_one(&job.invocation_arn).await?;
//!     println!("{:?}", outcome.artifact_path());
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `bedrock`: Amazon Bedrock job service and S3 object store
//! - `cli`: Command-line interface

mod error;
pub mod job;
pub mod media;
mod monitor;
pub mod persist;
mod request;

// Re-export error types at crate root
pub use error::{ReelWatchError, Result};

pub use job::{
    ArtifactRecord, Job, JobFilter, JobOutcome, JobService, JobServiceExt, JobStatus,
    ObjectStore, S3Location, Submission,
};
pub use monitor::{
    JobMonitor, JobMonitorBuilder, SweepInterruption, SweepReport, DEFAULT_MAX_POLL_ERRORS,
    DEFAULT_POLL_INTERVAL, DEFAULT_SUBMIT_RETRIES, DEFAULT_THROTTLE_BACKOFF,
};
pub use persist::{ArtifactStore, FolderTimezone};
pub use request::{ImageFormat, VideoGenerationRequest, DEFAULT_MODEL_ID};

#[cfg(feature = "bedrock")]
pub use job::providers;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{ReelWatchError, Result};
    pub use crate::job::{Job, JobOutcome, JobService, JobServiceExt, JobStatus, ObjectStore};
    pub use crate::monitor::JobMonitor;
    pub use crate::request::VideoGenerationRequest;

    #[cfg(feature = "bedrock")]
    pub use crate::job::providers::{BedrockJobService, S3ObjectStore};
}
