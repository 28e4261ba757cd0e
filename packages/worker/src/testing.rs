//! In-memory fakes for scheduler tests: a control store with the same
//! semantics as the SQL one, plus scripted collectors and a recording
//! sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use collection::config::{DataSourceConfig, StorageConfig};
use collection::error::{CollectError, CollectResult, StoreResult};
use collection::record::Record;
use collection::traits::{Collector, Sink};

use crate::job::{AttemptStatus, CollectionJob, ExecutionAttempt, JobStatus};
use crate::store::JobStore;

/// Control-store fake mirroring the SQL semantics row for row.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<i64, CollectionJob>>,
    attempts: Mutex<Vec<ExecutionAttempt>>,
    data_sources: Mutex<HashMap<i64, (String, serde_json::Value)>>,
    next_attempt_id: AtomicI64,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job(&self, job: CollectionJob) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn insert_data_source(&self, id: i64, source_type: &str, config: serde_json::Value) {
        self.data_sources
            .lock()
            .unwrap()
            .insert(id, (source_type.to_string(), config));
    }

    pub fn job(&self, id: i64) -> Option<CollectionJob> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn attempts(&self) -> Vec<ExecutionAttempt> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn list_due_jobs(&self, worker_type: &str) -> Result<Vec<CollectionJob>> {
        let now = Utc::now();
        let running: HashMap<i64, i32> = {
            let attempts = self.attempts.lock().unwrap();
            let mut counts = HashMap::new();
            for attempt in attempts.iter() {
                if attempt.status == AttemptStatus::Running {
                    *counts.entry(attempt.job_id).or_insert(0) += 1;
                }
            }
            counts
        };

        let jobs = self.jobs.lock().unwrap();
        let mut due: Vec<CollectionJob> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Enabled)
            .filter(|j| j.job_type == worker_type)
            .filter(|j| j.next_run_time.is_some_and(|t| t <= now))
            .filter(|j| running.get(&j.id).copied().unwrap_or(0) < j.replicas())
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_run_time);
        due.truncate(10);
        Ok(due)
    }

    async fn try_lease(&self, job_id: i64) -> Result<bool> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };

        let due = job.status == JobStatus::Enabled && job.next_run_time.is_some_and(|t| t <= now);
        if !due {
            return Ok(false);
        }

        job.next_run_time = Some(now + Duration::hours(1));
        job.updated_at = now;
        Ok(true)
    }

    async fn open_attempt(&self, job_id: i64, worker_identity: &str) -> Result<i64> {
        let id = self.next_attempt_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.attempts.lock().unwrap().push(ExecutionAttempt {
            id,
            job_id,
            worker_identity: worker_identity.to_string(),
            status: AttemptStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            records_collected: 0,
            error_message: String::new(),
            retry_count: 0,
        });
        Ok(id)
    }

    async fn close_attempt(
        &self,
        attempt_id: i64,
        status: AttemptStatus,
        records_collected: i64,
        error_message: &str,
        retry_count: i32,
    ) -> Result<()> {
        let mut attempts = self.attempts.lock().unwrap();
        let attempt = attempts
            .iter_mut()
            .find(|a| a.id == attempt_id)
            .context("attempt not found")?;

        attempt.status = status;
        attempt.end_time = Some(Utc::now());
        attempt.records_collected = records_collected;
        attempt.error_message = error_message.to_string();
        attempt.retry_count = retry_count;
        Ok(())
    }

    async fn reschedule_next(&self, job_id: i64, next_time: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).context("job not found")?;
        job.next_run_time = Some(next_time);
        Ok(())
    }

    async fn clear_next(&self, job_id: i64) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).context("job not found")?;
        job.next_run_time = None;
        Ok(())
    }

    async fn resolve_data_source(
        &self,
        data_source_id: i64,
    ) -> Result<(String, serde_json::Value)> {
        let sources = self.data_sources.lock().unwrap();
        match sources.get(&data_source_id) {
            Some((source_type, config)) => Ok((source_type.clone(), config.clone())),
            None => bail!("data source {data_source_id} not found"),
        }
    }
}

/// Collector that fails a scripted number of times, then yields fixed
/// records. With zero scripted failures it always succeeds.
pub struct ScriptedCollector {
    type_tag: &'static str,
    failures_remaining: AtomicU32,
    records: Vec<Record>,
    pub calls: AtomicU32,
}

impl ScriptedCollector {
    pub fn succeeding(type_tag: &'static str, records: Vec<Record>) -> Self {
        Self::new(type_tag, 0, records)
    }

    pub fn new(type_tag: &'static str, failures: u32, records: Vec<Record>) -> Self {
        Self {
            type_tag,
            failures_remaining: AtomicU32::new(failures),
            records,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Collector for ScriptedCollector {
    fn type_tag(&self) -> &'static str {
        self.type_tag
    }

    async fn collect(
        &self,
        _cancel: &CancellationToken,
        _config: &DataSourceConfig,
    ) -> CollectResult<Vec<Record>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(CollectError::Http("simulated timeout".into()));
        }
        Ok(self.records.clone())
    }
}

/// Collector that trips the given token and reports cancellation, to
/// exercise the shutdown path.
pub struct CancellingCollector {
    type_tag: &'static str,
    shutdown: CancellationToken,
}

impl CancellingCollector {
    pub fn new(type_tag: &'static str, shutdown: CancellationToken) -> Self {
        Self { type_tag, shutdown }
    }
}

#[async_trait]
impl Collector for CancellingCollector {
    fn type_tag(&self) -> &'static str {
        self.type_tag
    }

    async fn collect(
        &self,
        cancel: &CancellationToken,
        _config: &DataSourceConfig,
    ) -> CollectResult<Vec<Record>> {
        self.shutdown.cancel();
        cancel.cancelled().await;
        Err(CollectError::Cancelled)
    }
}

/// Sink that remembers every batch it was handed.
#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<(StorageConfig, Vec<Record>)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<(StorageConfig, Vec<Record>)> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn type_tag(&self) -> &'static str {
        "memory"
    }

    async fn store(
        &self,
        _cancel: &CancellationToken,
        config: &StorageConfig,
        records: &[Record],
    ) -> StoreResult<()> {
        self.batches
            .lock()
            .unwrap()
            .push((config.clone(), records.to_vec()));
        Ok(())
    }
}
