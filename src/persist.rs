//! On-disk layout for job outcomes.
//!
//! Every job gets one folder under the output root, named
//! `<submit time>_<job id>`:
//!
//! ```text
//! output/
//! └── 2024-01-01_10-00-00_abc123/
//!     ├── model_input.json
//!     ├── start_async_invoke_response.json
//!     ├── completed.json        (or failed.json)
//!     └── abc123.mp4
//! ```
//!
//! The presence of the artifact or of `failed.json` marks a job as handled,
//! so persisting the same job again is a no-op.

use crate::error::{ReelWatchError, Result};
use crate::job::{ArtifactRecord, Job, JobOutcome, ObjectStore, Submission};
use chrono::Local;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;

/// Snapshot written once a job completed and its artifact was downloaded.
pub const COMPLETED_FILE: &str = "completed.json";
/// Snapshot written once a job failed.
pub const FAILED_FILE: &str = "failed.json";
/// The exact payload that was submitted.
pub const MODEL_INPUT_FILE: &str = "model_input.json";
/// The submission acknowledgement.
pub const SUBMISSION_FILE: &str = "start_async_invoke_response.json";

const LOCK_FILE: &str = ".reelwatch.lock";
const FOLDER_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const STALE_LOCK_AFTER: Duration = Duration::from_secs(600);

/// Timezone used to render the submit time in folder names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FolderTimezone {
    /// The machine's local timezone.
    #[default]
    Local,
    /// UTC, for output that must not depend on the host.
    Utc,
}

/// Local store for job snapshots and downloaded artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    timezone: FolderTimezone,
    extension: String,
}

impl ArtifactStore {
    /// Creates a store rooted at `root`, expecting `.mp4` artifacts.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            timezone: FolderTimezone::default(),
            extension: "mp4".to_string(),
        }
    }

    /// Sets the timezone used in folder names.
    pub fn with_timezone(mut self, timezone: FolderTimezone) -> Self {
        self.timezone = timezone;
        self
    }

    /// Sets the artifact file extension (without the dot).
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    /// Output root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder name for a job: submit time followed by the job id.
    pub fn folder_name(&self, job: &Job) -> String {
        let timestamp = match self.timezone {
            FolderTimezone::Local => job
                .submit_time
                .with_timezone(&Local)
                .format(FOLDER_TIME_FORMAT)
                .to_string(),
            FolderTimezone::Utc => job.submit_time.format(FOLDER_TIME_FORMAT).to_string(),
        };
        format!("{}_{}", timestamp, job.job_id())
    }

    /// Folder holding everything about `job`.
    pub fn job_dir(&self, job: &Job) -> PathBuf {
        self.root.join(self.folder_name(job))
    }

    /// Where the artifact of `job` is stored once downloaded.
    pub fn artifact_path(&self, job: &Job) -> PathBuf {
        self.job_dir(job)
            .join(format!("{}.{}", job.job_id(), self.extension))
    }

    /// Returns true if the artifact of `job` is already on disk.
    pub async fn is_downloaded(&self, job: &Job) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.artifact_path(job)).await?)
    }

    /// Records the submitted payload and the submission acknowledgement.
    pub async fn save_invocation_info(
        &self,
        job: &Job,
        submission: &Submission,
        model_input: &serde_json::Value,
    ) -> Result<PathBuf> {
        let dir = self.job_dir(job);
        tokio::fs::create_dir_all(&dir).await?;
        write_snapshot(&dir.join(SUBMISSION_FILE), submission).await?;
        write_snapshot(&dir.join(MODEL_INPUT_FILE), model_input).await?;
        tracing::info!(job_id = job.job_id(), dir = %dir.display(), "saved invocation info");
        Ok(dir)
    }

    /// Downloads the artifact of a completed job and writes `completed.json`.
    ///
    /// Returns [`JobOutcome::AlreadyDownloaded`] without touching the network
    /// or the snapshot when the artifact is already on disk, and
    /// [`JobOutcome::ArtifactMissing`] when the output location holds no
    /// matching object. In the latter case no snapshot is written, so a later
    /// run tries again.
    pub async fn persist_completed(
        &self,
        job: &Job,
        objects: &dyn ObjectStore,
    ) -> Result<JobOutcome> {
        let job_id = job.job_id();
        let artifact = self.artifact_path(job);
        let record = ArtifactRecord {
            invocation_arn: job.invocation_arn.clone(),
            path: artifact.clone(),
        };

        if tokio::fs::try_exists(&artifact).await? {
            tracing::info!(job_id, path = %artifact.display(), "skipping completed job, already downloaded");
            return Ok(JobOutcome::AlreadyDownloaded(record));
        }

        let dir = self.job_dir(job);
        tokio::fs::create_dir_all(&dir).await?;
        let _lock = JobLock::acquire(&dir).await?;
        if tokio::fs::try_exists(&artifact).await? {
            tracing::info!(job_id, path = %artifact.display(), "artifact appeared while waiting for lock");
            return Ok(JobOutcome::AlreadyDownloaded(record));
        }

        let location = job.output_data_config.location()?;
        let prefix = location.job_prefix(job_id);
        let suffix = format!(".{}", self.extension);
        let keys = objects.list_keys(&location.bucket, &prefix).await?;
        let Some(key) = keys
            .iter()
            .find(|key| belongs_to(key, &prefix) && key.ends_with(&suffix))
        else {
            tracing::error!(
                job_id,
                bucket = %location.bucket,
                prefix = %prefix,
                "no {suffix} artifact found for completed job"
            );
            return Ok(JobOutcome::ArtifactMissing);
        };

        // The artifact marks the job as handled, so it only moves into place
        // once completed.json is on disk.
        let staging = artifact.with_extension(format!("{}.download", self.extension));
        let bytes = objects.download(&location.bucket, key, &staging).await?;
        if let Err(e) = write_snapshot(&dir.join(COMPLETED_FILE), job).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e);
        }
        tokio::fs::rename(&staging, &artifact).await?;
        tracing::info!(
            job_id,
            key = %key,
            bytes,
            path = %artifact.display(),
            "downloaded artifact"
        );

        Ok(JobOutcome::Downloaded(record))
    }

    /// Writes `failed.json` for a failed job.
    ///
    /// Returns `false` without writing if the snapshot already exists.
    pub async fn persist_failed(&self, job: &Job) -> Result<bool> {
        let job_id = job.job_id();
        let dir = self.job_dir(job);
        let path = dir.join(FAILED_FILE);

        if tokio::fs::try_exists(&path).await? {
            tracing::info!(job_id, "skipping failed job, snapshot already exists");
            return Ok(false);
        }

        tokio::fs::create_dir_all(&dir).await?;
        let _lock = JobLock::acquire(&dir).await?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }

        write_snapshot(&path, job).await?;
        tracing::info!(
            job_id,
            reason = job.failure_message.as_deref().unwrap_or("unknown"),
            path = %path.display(),
            "saved failed job"
        );
        Ok(true)
    }
}

/// Keys of job `abc123` live under `abc123/` or are named `abc123.*`,
/// so a listing for `abc123` must not pick up `abc1234/...`.
fn belongs_to(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('.'))
}

/// Writes pretty-printed JSON, replacing the target atomically.
async fn write_snapshot<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Advisory per-job lock; the lock file is removed on drop.
#[derive(Debug)]
struct JobLock {
    path: PathBuf,
}

impl JobLock {
    async fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        match create_lock_file(&path).await {
            Ok(()) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if !is_stale(&path).await {
                    return Err(locked(dir));
                }
                tracing::warn!(path = %path.display(), "reclaiming stale job lock");
                Self::reclaim(dir, path).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Moves the stale lock aside before creating a fresh one. The rename is
    /// atomic, so when two monitors race only one of them takes the old file;
    /// if that file turns out to be a fresh lock it is put back.
    async fn reclaim(dir: &Path, path: PathBuf) -> Result<Self> {
        let aside = path.with_extension(format!("stale.{}", std::process::id()));
        match tokio::fs::rename(&path, &aside).await {
            Ok(()) => {
                if !is_stale(&aside).await {
                    let _ = tokio::fs::hard_link(&aside, &path).await;
                    let _ = tokio::fs::remove_file(&aside).await;
                    return Err(locked(dir));
                }
                tokio::fs::remove_file(&aside).await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        match create_lock_file(&path).await {
            Ok(()) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(locked(dir)),
            Err(e) => Err(e.into()),
        }
    }
}

fn locked(dir: &Path) -> ReelWatchError {
    ReelWatchError::Locked(dir.display().to_string())
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), "failed to release job lock: {e}");
        }
    }
}

async fn create_lock_file(path: &Path) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(format!("{}\n", std::process::id()).as_bytes())
        .await?;
    file.flush().await
}

async fn is_stale(path: &Path) -> bool {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return true;
    };
    metadata
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AFTER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::testing::FakeObjectStore;
    use crate::job::JobStatus;
    use chrono::{TimeZone, Utc};

    fn store(root: &Path) -> ArtifactStore {
        ArtifactStore::new(root).with_timezone(FolderTimezone::Utc)
    }

    fn job(status: JobStatus) -> Job {
        Job::new(
            "abc123",
            status,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
            "s3://nova-videos",
        )
    }

    #[test]
    fn test_folder_name_is_deterministic() {
        let store = ArtifactStore::new("output").with_timezone(FolderTimezone::Utc);
        let mut j = job(JobStatus::InProgress);
        j.invocation_arn = "arn:aws:bedrock:us-east-1:123456789012:async-invoke/abc123".into();

        assert_eq!(store.folder_name(&j), "2024-01-01_10-00-00_abc123");
        assert_eq!(store.folder_name(&j), store.folder_name(&j.clone()));

        // Status changes do not move the folder
        j.status = JobStatus::Completed;
        assert_eq!(store.folder_name(&j), "2024-01-01_10-00-00_abc123");
    }

    #[test]
    fn test_artifact_path_uses_extension() {
        let store = ArtifactStore::new("out")
            .with_timezone(FolderTimezone::Utc)
            .with_extension(".png");
        assert_eq!(
            store.artifact_path(&job(JobStatus::Completed)),
            PathBuf::from("out/2024-01-01_10-00-00_abc123/abc123.png")
        );
    }

    #[tokio::test]
    async fn test_persist_completed_downloads_and_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let objects = FakeObjectStore::new();
        objects.put("nova-videos", "abc123.mp4", b"video-bytes");

        let outcome = store
            .persist_completed(&job(JobStatus::Completed), &objects)
            .await
            .unwrap();

        let expected = tmp.path().join("2024-01-01_10-00-00_abc123/abc123.mp4");
        assert_eq!(outcome.artifact_path(), Some(expected.as_path()));
        assert!(matches!(outcome, JobOutcome::Downloaded(_)));
        assert_eq!(std::fs::read(&expected).unwrap(), b"video-bytes");

        let snapshot: Job = serde_json::from_slice(
            &std::fs::read(tmp.path().join("2024-01-01_10-00-00_abc123/completed.json"))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(snapshot, job(JobStatus::Completed));

        // Lock released
        assert!(!tmp
            .path()
            .join("2024-01-01_10-00-00_abc123")
            .join(LOCK_FILE)
            .exists());
    }

    #[tokio::test]
    async fn test_persist_completed_twice_downloads_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let objects = FakeObjectStore::new();
        objects.put("nova-videos", "abc123.mp4", b"video-bytes");
        let j = job(JobStatus::Completed);

        store.persist_completed(&j, &objects).await.unwrap();
        let snapshot_path = store.job_dir(&j).join(COMPLETED_FILE);
        std::fs::write(&snapshot_path, "marker").unwrap();

        let second = store.persist_completed(&j, &objects).await.unwrap();

        assert!(matches!(second, JobOutcome::AlreadyDownloaded(_)));
        assert_eq!(objects.downloads(), 1);
        assert_eq!(std::fs::read_to_string(&snapshot_path).unwrap(), "marker");
    }

    #[tokio::test]
    async fn test_persist_completed_missing_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let objects = FakeObjectStore::new();
        objects.put("nova-videos", "abc123/manifest.json", b"{}");
        objects.put("nova-videos", "other/output.mp4", b"not ours");
        let j = job(JobStatus::Completed);

        let outcome = store.persist_completed(&j, &objects).await.unwrap();

        assert_eq!(outcome, JobOutcome::ArtifactMissing);
        assert_eq!(objects.downloads(), 0);
        assert!(!store.artifact_path(&j).exists());
        assert!(!store.job_dir(&j).join(COMPLETED_FILE).exists());
    }

    #[tokio::test]
    async fn test_persist_completed_respects_uri_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let objects = FakeObjectStore::new();
        objects.put("nova-videos", "reels/abc123/output.mp4", b"nested");
        let mut j = job(JobStatus::Completed);
        j.output_data_config = crate::job::OutputDataConfig::s3("s3://nova-videos/reels");

        let outcome = store.persist_completed(&j, &objects).await.unwrap();

        assert!(matches!(outcome, JobOutcome::Downloaded(_)));
        assert_eq!(std::fs::read(store.artifact_path(&j)).unwrap(), b"nested");
    }

    #[tokio::test]
    async fn test_persist_failed_writes_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let mut j = job(JobStatus::Failed);
        j.failure_message = Some("Internal server error".into());

        assert!(store.persist_failed(&j).await.unwrap());
        let path = store.job_dir(&j).join(FAILED_FILE);
        let snapshot: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(snapshot["status"], "Failed");
        assert_eq!(snapshot["failureMessage"], "Internal server error");

        std::fs::write(&path, "marker").unwrap();
        assert!(!store.persist_failed(&j).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "marker");
    }

    #[tokio::test]
    async fn test_persist_failed_refuses_when_locked() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let j = job(JobStatus::Failed);
        std::fs::create_dir_all(store.job_dir(&j)).unwrap();
        std::fs::write(store.job_dir(&j).join(LOCK_FILE), "4242\n").unwrap();

        let result = store.persist_failed(&j).await;

        assert!(matches!(result, Err(ReelWatchError::Locked(_))));
        assert!(!store.job_dir(&j).join(FAILED_FILE).exists());
    }

    #[tokio::test]
    async fn test_persist_completed_retries_after_snapshot_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let objects = FakeObjectStore::new();
        objects.put("nova-videos", "abc123/output.mp4", b"video-bytes");
        let j = job(JobStatus::Completed);
        let snapshot_path = store.job_dir(&j).join(COMPLETED_FILE);
        // A directory in the way makes the snapshot rename fail
        std::fs::create_dir_all(&snapshot_path).unwrap();

        assert!(store.persist_completed(&j, &objects).await.is_err());
        assert!(!store.artifact_path(&j).exists());

        std::fs::remove_dir(&snapshot_path).unwrap();
        let outcome = store.persist_completed(&j, &objects).await.unwrap();

        assert!(matches!(outcome, JobOutcome::Downloaded(_)));
        assert_eq!(std::fs::read(store.artifact_path(&j)).unwrap(), b"video-bytes");
        assert!(snapshot_path.is_file());
        assert_eq!(objects.downloads(), 2);
        let leftovers: Vec<_> = std::fs::read_dir(store.job_dir(&j))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".download") || name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "staging files left behind: {leftovers:?}");
    }

    #[tokio::test]
    async fn test_persist_completed_ignores_longer_job_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let objects = FakeObjectStore::new();
        objects.put("nova-videos", "abc1234/output.mp4", b"someone else");
        let j = job(JobStatus::Completed);

        let outcome = store.persist_completed(&j, &objects).await.unwrap();
        assert_eq!(outcome, JobOutcome::ArtifactMissing);

        objects.put("nova-videos", "abc123/output.mp4", b"ours");
        store.persist_completed(&j, &objects).await.unwrap();
        assert_eq!(std::fs::read(store.artifact_path(&j)).unwrap(), b"ours");
    }

    #[test]
    fn test_belongs_to() {
        assert!(belongs_to("abc123/output.mp4", "abc123"));
        assert!(belongs_to("abc123.mp4", "abc123"));
        assert!(belongs_to("reels/abc123/output.mp4", "reels/abc123"));
        assert!(!belongs_to("abc1234/output.mp4", "abc123"));
        assert!(!belongs_to("other/abc123.mp4", "abc123"));
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let j = job(JobStatus::Failed);
        let lock_path = store.job_dir(&j).join(LOCK_FILE);
        std::fs::create_dir_all(store.job_dir(&j)).unwrap();
        std::fs::write(&lock_path, "4242\n").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&lock_path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(1200))
            .unwrap();

        assert!(store.persist_failed(&j).await.unwrap());
        assert!(store.job_dir(&j).join(FAILED_FILE).exists());
        assert!(!lock_path.exists());
        let names: Vec<_> = std::fs::read_dir(store.job_dir(&j))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(!names.iter().any(|name| name.contains("stale")), "{names:?}");
    }

    #[tokio::test]
    async fn test_reclaim_keeps_fresh_lock_taken_in_between() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("job");
        std::fs::create_dir_all(&dir).unwrap();
        let lock_path = dir.join(LOCK_FILE);
        // Another monitor reclaimed the stale lock and holds a fresh one
        std::fs::write(&lock_path, "4242\n").unwrap();

        let result = JobLock::reclaim(&dir, lock_path.clone()).await;

        assert!(matches!(result, Err(ReelWatchError::Locked(_))));
        assert_eq!(std::fs::read_to_string(&lock_path).unwrap(), "4242\n");
    }

    #[tokio::test]
    async fn test_save_invocation_info() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let j = job(JobStatus::InProgress);
        let submission = Submission {
            invocation_arn: "abc123".into(),
        };
        let input = serde_json::json!({"taskType": "TEXT_VIDEO"});

        let dir = store.save_invocation_info(&j, &submission, &input).await.unwrap();

        assert_eq!(dir, tmp.path().join("2024-01-01_10-00-00_abc123"));
        let saved: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join(MODEL_INPUT_FILE)).unwrap()).unwrap();
        assert_eq!(saved, input);
        let ack: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join(SUBMISSION_FILE)).unwrap()).unwrap();
        assert_eq!(ack["invocationArn"], "abc123");
    }
}
