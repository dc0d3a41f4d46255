//! Poll asynchronous jobs until they finish and materialize their results.

use crate::error::{ReelWatchError, Result};
use crate::job::{
    ArtifactRecord, Job, JobFilter, JobOutcome, JobService, JobServiceExt, JobStatus, ObjectStore,
};
use crate::persist::{ArtifactStore, FolderTimezone};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Default pause between two status queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Default wait before retrying a throttled submission.
pub const DEFAULT_THROTTLE_BACKOFF: Duration = Duration::from_secs(90);
/// Default number of retries for a throttled submission.
pub const DEFAULT_SUBMIT_RETRIES: u32 = 2;
/// Default number of consecutive transient polling errors tolerated.
pub const DEFAULT_MAX_POLL_ERRORS: u32 = 5;

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(300);

/// Builder for JobMonitor.
pub struct JobMonitorBuilder {
    service: Arc<dyn JobService>,
    objects: Arc<dyn ObjectStore>,
    output_dir: Option<PathBuf>,
    timezone: FolderTimezone,
    extension: String,
    poll_interval: Duration,
    timeout: Option<Duration>,
    max_poll_errors: u32,
    submit_retries: u32,
    throttle_backoff: Duration,
    cancel: CancellationToken,
}

impl JobMonitorBuilder {
    /// Creates a builder around the remote job service and object store.
    pub fn new(service: Arc<dyn JobService>, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            service,
            objects,
            output_dir: None,
            timezone: FolderTimezone::default(),
            extension: "mp4".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
            max_poll_errors: DEFAULT_MAX_POLL_ERRORS,
            submit_retries: DEFAULT_SUBMIT_RETRIES,
            throttle_backoff: DEFAULT_THROTTLE_BACKOFF,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the output root. Falls back to `REELWATCH_OUTPUT_DIR`, then `output`.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Sets the timezone used in job folder names.
    pub fn timezone(mut self, timezone: FolderTimezone) -> Self {
        self.timezone = timezone;
        self
    }

    /// Sets the artifact file extension (defaults to `mp4`).
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Sets the pause between status queries.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the maximum time to wait for a job. Unbounded by default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets how many consecutive transient polling errors are tolerated.
    pub fn max_poll_errors(mut self, max: u32) -> Self {
        self.max_poll_errors = max;
        self
    }

    /// Sets the retry budget and backoff for throttled submissions.
    pub fn submit_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.submit_retries = retries;
        self.throttle_backoff = backoff;
        self
    }

    /// Uses an external cancellation token (e.g. wired to Ctrl-C).
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Builds the monitor.
    pub fn build(self) -> JobMonitor {
        let output_dir = self
            .output_dir
            .or_else(|| std::env::var_os("REELWATCH_OUTPUT_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("output"));

        JobMonitor {
            service: self.service,
            objects: self.objects,
            artifacts: ArtifactStore::new(output_dir)
                .with_timezone(self.timezone)
                .with_extension(self.extension),
            poll_interval: self.poll_interval,
            timeout: self.timeout,
            max_poll_errors: self.max_poll_errors,
            submit_retries: self.submit_retries,
            throttle_backoff: self.throttle_backoff,
            cancel: self.cancel,
        }
    }
}

/// Drives asynchronous jobs to a terminal state and persists their outcome.
pub struct JobMonitor {
    service: Arc<dyn JobService>,
    objects: Arc<dyn ObjectStore>,
    artifacts: ArtifactStore,
    poll_interval: Duration,
    timeout: Option<Duration>,
    max_poll_errors: u32,
    submit_retries: u32,
    throttle_backoff: Duration,
    cancel: CancellationToken,
}

/// What a batch sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Artifacts downloaded during this sweep.
    pub downloaded: Vec<ArtifactRecord>,
    /// Completed jobs whose artifact was already on disk.
    pub already_downloaded: usize,
    /// Handles of failed jobs.
    pub failed: Vec<String>,
    /// Handles of completed jobs without a matching artifact.
    pub missing: Vec<String>,
    /// Handles whose processing errored, with the error message.
    pub errors: Vec<(String, String)>,
    /// Handles still in progress when the sweep stopped early.
    pub pending: Vec<String>,
    /// Why the sweep stopped before every job was terminal.
    pub interrupted: Option<SweepInterruption>,
}

/// Reason a sweep returned while jobs were still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepInterruption {
    /// The configured maximum wait elapsed.
    TimedOut(Duration),
    /// The monitor's cancellation token fired.
    Cancelled,
}

impl fmt::Display for SweepInterruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut(after) => write!(f, "timed out after {after:?}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl SweepReport {
    /// True when every listed job reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.interrupted.is_none()
    }

    fn interrupt(&mut self, reason: ReelWatchError, pending: Vec<String>) -> Result<()> {
        let interruption = match reason {
            ReelWatchError::Timeout(after) => SweepInterruption::TimedOut(after),
            ReelWatchError::Cancelled => SweepInterruption::Cancelled,
            other => return Err(other),
        };
        tracing::warn!(pending = pending.len(), "sweep {interruption}");
        self.interrupted = Some(interruption);
        self.pending = pending;
        Ok(())
    }

    fn record(&mut self, handle: &str, result: Result<JobOutcome>) {
        match result {
            Ok(JobOutcome::Downloaded(record)) => self.downloaded.push(record),
            Ok(JobOutcome::AlreadyDownloaded(_)) => self.already_downloaded += 1,
            Ok(JobOutcome::Failed { .. }) => self.failed.push(handle.to_string()),
            Ok(JobOutcome::ArtifactMissing) => self.missing.push(handle.to_string()),
            Err(e) => {
                tracing::error!(handle, "job processing failed: {e}");
                self.errors.push((handle.to_string(), e.to_string()));
            }
        }
    }
}

impl JobMonitor {
    /// Creates a new `JobMonitorBuilder`.
    pub fn builder(service: Arc<dyn JobService>, objects: Arc<dyn ObjectStore>) -> JobMonitorBuilder {
        JobMonitorBuilder::new(service, objects)
    }

    /// Local artifact store.
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// The remote job service.
    pub fn service(&self) -> &dyn JobService {
        self.service.as_ref()
    }

    /// Token that stops every wait of this monitor when cancelled.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Submits a job and records its payload and acknowledgement on disk.
    ///
    /// Throttled submissions are retried with the configured backoff.
    pub async fn start_job(
        &self,
        model_id: &str,
        model_input: &serde_json::Value,
        output_uri: &str,
    ) -> Result<Job> {
        let submission = self
            .service
            .submit_with_retries(
                model_id,
                model_input,
                output_uri,
                self.submit_retries,
                self.throttle_backoff,
            )
            .await?;
        tracing::info!(invocation_arn = %submission.invocation_arn, "started async job");

        let job = self.service.get(&submission.invocation_arn).await?;
        self.artifacts
            .save_invocation_info(&job, &submission, model_input)
            .await?;
        Ok(job)
    }

    /// Polls `handle` until it is terminal, then persists the outcome.
    ///
    /// Transient query errors are retried with exponential backoff up to the
    /// configured budget. Fails with [`ReelWatchError::Timeout`] or
    /// [`ReelWatchError::Cancelled`] if the wait is cut short.
    pub async fn monitor_one(&self, handle: &str) -> Result<JobOutcome> {
        tracing::info!(handle, "monitoring job");
        let start = Instant::now();
        let mut consecutive_errors = 0;

        loop {
            self.check_deadline(start)?;

            match self.service.get(handle).await {
                Ok(job) => {
                    consecutive_errors = 0;
                    if job.status.is_terminal() {
                        return self.persist(&job).await;
                    }
                    log_progress(&job);
                    self.pause(self.poll_interval).await?;
                }
                Err(e) if e.is_retryable() && consecutive_errors < self.max_poll_errors => {
                    consecutive_errors += 1;
                    let delay = self.error_backoff(&e, consecutive_errors);
                    tracing::warn!(
                        handle,
                        attempt = consecutive_errors,
                        delay_secs = delay.as_secs(),
                        "status query failed, retrying: {e}"
                    );
                    self.pause(delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handles every job matching `filter`: terminal ones immediately, then
    /// the in-progress ones in polling sweeps until none is left.
    ///
    /// The filter's status is ignored; each status is listed in turn.
    /// Failures of individual jobs are logged and reported, never fatal. A
    /// job whose status queries keep failing is dropped from the sweep once
    /// it exceeds the poll-error budget. On timeout or cancellation the
    /// partial report is returned with [`SweepReport::interrupted`] set.
    pub async fn monitor_many(&self, filter: &JobFilter) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for job in self.service.list(&with_status(filter, JobStatus::Failed)).await? {
            let result = self.persist(&job).await;
            report.record(&job.invocation_arn, result);
        }
        for job in self
            .service
            .list(&with_status(filter, JobStatus::Completed))
            .await?
        {
            let result = self.persist(&job).await;
            report.record(&job.invocation_arn, result);
        }

        let mut pending: Vec<String> = self
            .service
            .list(&with_status(filter, JobStatus::InProgress))
            .await?
            .into_iter()
            .map(|job| job.invocation_arn)
            .collect();
        tracing::info!(pending = pending.len(), "monitoring in-progress jobs");

        let start = Instant::now();
        let mut poll_errors: HashMap<String, u32> = HashMap::new();
        while !pending.is_empty() {
            if let Err(e) = self.check_deadline(start) {
                report.interrupt(e, pending)?;
                break;
            }

            let mut still_pending = Vec::with_capacity(pending.len());
            let mut delay = self.poll_interval;
            for handle in pending {
                match self.service.get(&handle).await {
                    Ok(job) if job.status.is_terminal() => {
                        poll_errors.remove(&handle);
                        let result = self.persist(&job).await;
                        report.record(&handle, result);
                    }
                    Ok(job) => {
                        poll_errors.remove(&handle);
                        log_progress(&job);
                        still_pending.push(handle);
                    }
                    Err(e) if e.is_retryable() => {
                        let errors = poll_errors.entry(handle.clone()).or_default();
                        *errors += 1;
                        if *errors > self.max_poll_errors {
                            report.record(&handle, Err(e));
                            continue;
                        }
                        let backoff = self.error_backoff(&e, *errors);
                        tracing::warn!(
                            handle = %handle,
                            attempt = *errors,
                            delay_secs = backoff.as_secs(),
                            "status query failed, will retry: {e}"
                        );
                        delay = delay.max(backoff);
                        still_pending.push(handle);
                    }
                    Err(e) => report.record(&handle, Err(e)),
                }
            }
            pending = still_pending;

            if !pending.is_empty() {
                if let Err(e) = self.pause(delay).await {
                    report.interrupt(e, pending)?;
                    break;
                }
            }
        }

        tracing::info!(
            downloaded = report.downloaded.len(),
            already_downloaded = report.already_downloaded,
            failed = report.failed.len(),
            missing = report.missing.len(),
            errors = report.errors.len(),
            "monitoring complete"
        );
        Ok(report)
    }

    /// Downloads the artifact of a completed job (idempotent).
    pub async fn persist_completed(&self, job: &Job) -> Result<JobOutcome> {
        self.artifacts
            .persist_completed(job, self.objects.as_ref())
            .await
    }

    /// Writes the failure snapshot of a failed job (idempotent).
    pub async fn persist_failed(&self, job: &Job) -> Result<()> {
        self.artifacts.persist_failed(job).await.map(|_| ())
    }

    async fn persist(&self, job: &Job) -> Result<JobOutcome> {
        match job.status {
            JobStatus::Completed => self.persist_completed(job).await,
            JobStatus::Failed => {
                self.persist_failed(job).await?;
                Ok(JobOutcome::Failed {
                    message: job.failure_message.clone(),
                })
            }
            status => Err(ReelWatchError::UnexpectedResponse(format!(
                "job {} is not terminal ({status})",
                job.invocation_arn
            ))),
        }
    }

    fn check_deadline(&self, start: Instant) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ReelWatchError::Cancelled);
        }
        match self.timeout {
            Some(timeout) if start.elapsed() > timeout => Err(ReelWatchError::Timeout(timeout)),
            _ => Ok(()),
        }
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ReelWatchError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn error_backoff(&self, error: &ReelWatchError, attempt: u32) -> Duration {
        let base = error.retry_after().unwrap_or(self.poll_interval);
        base.saturating_mul(1 << (attempt - 1).min(6))
            .min(MAX_ERROR_BACKOFF)
    }
}

fn with_status(filter: &JobFilter, status: JobStatus) -> JobFilter {
    JobFilter {
        status_equals: Some(status),
        ..filter.clone()
    }
}

fn log_progress(job: &Job) {
    log_progress_at(job, Utc::now());
}

fn log_progress_at(job: &Job, now: DateTime<Utc>) {
    let (minutes, seconds) = split_minutes(job.elapsed_at(now));
    tracing::info!(
        job_id = job.job_id(),
        status = %job.status,
        "job still in progress, elapsed time: {minutes} minutes {seconds} seconds"
    );
}

fn split_minutes(elapsed: Duration) -> (u64, u64) {
    let secs = elapsed.as_secs();
    (secs / 60, secs % 60)
}
