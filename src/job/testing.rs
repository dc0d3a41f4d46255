//! In-memory service fakes shared by unit tests.

use crate::error::{ReelWatchError, Result};
use crate::job::service::{JobService, ObjectStore};
use crate::job::types::{Job, JobFilter, JobStatus, Submission};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Job service whose status responses are scripted per handle.
///
/// Each `get` pops the next scripted snapshot; the last one sticks, which
/// models the service never leaving a terminal state.
#[derive(Default)]
pub struct FakeJobService {
    jobs: Mutex<BTreeMap<String, VecDeque<Job>>>,
    submit_errors: Mutex<VecDeque<ReelWatchError>>,
    get_errors: Mutex<HashMap<String, VecDeque<ReelWatchError>>>,
    submit_calls: AtomicUsize,
    get_calls: Mutex<HashMap<String, usize>>,
}

impl FakeJobService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the snapshots returned for the handle of `states[0]`.
    pub fn script(&self, states: Vec<Job>) {
        let Some(first) = states.first() else {
            return;
        };
        let handle = first.invocation_arn.clone();
        self.jobs.lock().unwrap().insert(handle, states.into());
    }

    pub fn fail_next_submits(&self, errors: Vec<ReelWatchError>) {
        self.submit_errors.lock().unwrap().extend(errors);
    }

    pub fn fail_next_gets(&self, handle: &str, errors: Vec<ReelWatchError>) {
        self.get_errors
            .lock()
            .unwrap()
            .entry(handle.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self, handle: &str) -> usize {
        self.get_calls
            .lock()
            .unwrap()
            .get(handle)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobService for FakeJobService {
    async fn submit(
        &self,
        _model_id: &str,
        _model_input: &serde_json::Value,
        output_uri: &str,
    ) -> Result<Submission> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.submit_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut jobs = self.jobs.lock().unwrap();
        let arn = format!(
            "arn:aws:bedrock:us-east-1:123456789012:async-invoke/job-{}",
            jobs.len() + 1
        );
        let job = Job::new(&arn, JobStatus::InProgress, Utc::now(), output_uri);
        jobs.insert(arn.clone(), VecDeque::from([job]));
        Ok(Submission {
            invocation_arn: arn,
        })
    }

    async fn get(&self, handle: &str) -> Result<Job> {
        *self
            .get_calls
            .lock()
            .unwrap()
            .entry(handle.to_string())
            .or_default() += 1;

        if let Some(errors) = self.get_errors.lock().unwrap().get_mut(handle) {
            if let Some(err) = errors.pop_front() {
                return Err(err);
            }
        }

        let mut jobs = self.jobs.lock().unwrap();
        let states = jobs.get_mut(handle).ok_or_else(|| ReelWatchError::Api {
            status: 404,
            message: format!("no such job: {handle}"),
        })?;
        if states.len() > 1 {
            Ok(states.pop_front().unwrap())
        } else {
            Ok(states.front().cloned().unwrap())
        }
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap();
        let mut matching: Vec<Job> = jobs
            .values()
            .filter_map(|states| states.front())
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        if let Some(max) = filter.max_results {
            matching.truncate(max.max(0) as usize);
        }
        Ok(matching)
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Object store backed by a map, counting downloads.
#[derive(Default)]
pub struct FakeObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    downloads: AtomicUsize,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), data.to_vec());
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ReelWatchError::Api {
                status: 404,
                message: format!("no such key: s3://{bucket}/{key}"),
            })?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(dest, &data).await?;
        Ok(data.len() as u64)
    }
}
