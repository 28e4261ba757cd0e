//! The worker scheduler: poll → lease → execute → reschedule.
//!
//! One poll tick lists due jobs and processes them serially. Each leased
//! job runs exactly one attempt sequence (one history row regardless of
//! retries) and is then rescheduled by cron, or parked if it has none.
//! The lease itself is the one-hour `next_run_time` advance written by
//! `try_lease`; a generic unlock would reset it to now and cause
//! immediate re-pickup, so nothing here ever does that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use collection::config::{DataSourceConfig, StorageConfig, TaskConfig};
use collection::error::{CollectError, StoreError};
use collection::processor::{Deduplicator, Processor};
use collection::traits::{CollectorRegistry, SinkRegistry};

use crate::cron;
use crate::job::{AttemptStatus, CollectionJob};
use crate::metrics::WorkerMetrics;
use crate::retry::RetryPolicy;
use crate::store::JobStore;

/// Scheduler wiring and identity.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_type: String,
    pub poll_interval: Duration,
    pub worker_identity: String,
    /// Sink tag for synthesized storage targets.
    pub default_storage_target: String,
    /// Database name for synthesized storage targets.
    pub collected_database: String,
}

/// Drives the job-dispatch loop against a control store.
pub struct Scheduler<S: JobStore> {
    store: Arc<S>,
    collectors: Arc<CollectorRegistry>,
    sinks: Arc<SinkRegistry>,
    metrics: Arc<WorkerMetrics>,
    config: SchedulerConfig,
    /// Job-scoped duplicate filters, kept across attempts.
    deduplicators: Mutex<HashMap<i64, Arc<Deduplicator>>>,
}

impl<S: JobStore> Scheduler<S> {
    pub fn new(
        store: Arc<S>,
        collectors: Arc<CollectorRegistry>,
        sinks: Arc<SinkRegistry>,
        metrics: Arc<WorkerMetrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            collectors,
            sinks,
            metrics,
            config,
            deduplicators: Mutex::new(HashMap::new()),
        }
    }

    /// Poll until shutdown. The first tick fires immediately.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker = %self.config.worker_identity,
            worker_type = %self.config.worker_type,
            poll_interval = ?self.config.poll_interval,
            "worker scheduler starting"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.poll(&shutdown).await,
            }
        }

        for deduplicator in self.deduplicators.lock().expect("dedup map lock").values() {
            deduplicator.close();
        }

        info!(worker = %self.config.worker_identity, "worker scheduler stopped");
        Ok(())
    }

    /// One poll tick: list due jobs and run each leased one.
    pub async fn poll(&self, shutdown: &CancellationToken) {
        let jobs = match self.store.list_due_jobs(&self.config.worker_type).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %format!("{e:#}"), "failed to list due jobs");
                return;
            }
        };

        if jobs.is_empty() {
            debug!("no due jobs");
            return;
        }

        info!(count = jobs.len(), "due jobs found");

        for job in jobs {
            if shutdown.is_cancelled() {
                break;
            }

            match self.store.try_lease(job.id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = job.id, job = %job.name, "lease lost, skipping");
                    continue;
                }
                Err(e) => {
                    error!(job_id = job.id, error = %format!("{e:#}"), "lease attempt failed");
                    continue;
                }
            }

            info!(job_id = job.id, job = %job.name, "lease acquired, executing");

            if let Err(e) = self.execute_with_retry(shutdown, &job).await {
                warn!(job_id = job.id, job = %job.name, error = %format!("{e:#}"), "attempt sequence failed");
            }

            // Always reschedule, success or failure. A failure here is
            // logged but never alters the attempt's recorded outcome.
            self.reschedule(&job).await;
        }
    }

    async fn reschedule(&self, job: &CollectionJob) {
        match job.cron_expression() {
            Some(expression) => match cron::next_run_after(expression, Utc::now()) {
                Ok(next) => {
                    if let Err(e) = self.store.reschedule_next(job.id, next).await {
                        error!(job_id = job.id, error = %format!("{e:#}"), "failed to reschedule job");
                    } else {
                        debug!(job_id = job.id, next_run = %next, "job rescheduled");
                    }
                }
                Err(e) => {
                    // The job stays leased until the 1h advance expires;
                    // the operator sees this in the logs.
                    warn!(job_id = job.id, error = %format!("{e:#}"), "unparseable cron expression, job not rescheduled");
                }
            },
            None => {
                if let Err(e) = self.store.clear_next(job.id).await {
                    error!(job_id = job.id, error = %format!("{e:#}"), "failed to park one-shot job");
                }
            }
        }
    }

    /// One attempt sequence: exactly one history row, up to
    /// `max_retries` + 1 pipeline runs with backoff in between.
    async fn execute_with_retry(
        &self,
        shutdown: &CancellationToken,
        job: &CollectionJob,
    ) -> Result<()> {
        let policy = RetryPolicy::for_job(job.max_retries);
        let started = std::time::Instant::now();

        let attempt_id = self
            .store
            .open_attempt(job.id, &self.config.worker_identity)
            .await
            .context("failed to open attempt record")?;

        // Config problems fail the attempt immediately; the retry loop
        // never starts.
        let task_config = match self.resolve_task_config(job).await {
            Ok(config) => config,
            Err(e) => {
                let message = format!("failed to resolve task config: {e:#}");
                self.finish_attempt(attempt_id, AttemptStatus::Failed, 0, &message, 0, started)
                    .await;
                return Err(e);
            }
        };

        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=policy.max_retries {
            if attempt > 0 {
                let delay = policy.calculate_delay(attempt - 1);
                info!(job_id = job.id, attempt, delay = ?delay, "retrying after backoff");
                self.metrics.record_retry();

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        self.finish_attempt(
                            attempt_id,
                            AttemptStatus::Failed,
                            0,
                            "cancelled",
                            attempt as i32,
                            started,
                        )
                        .await;
                        return Err(anyhow!("attempt cancelled during backoff"));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.execute_once(shutdown, job, &task_config).await {
                Ok(count) => {
                    self.finish_attempt(
                        attempt_id,
                        AttemptStatus::Success,
                        count as i64,
                        "",
                        attempt as i32,
                        started,
                    )
                    .await;
                    info!(
                        job_id = job.id,
                        job = %job.name,
                        records = count,
                        elapsed = ?started.elapsed(),
                        "attempt succeeded"
                    );
                    return Ok(());
                }
                Err(e) if error_is_cancellation(&e) || shutdown.is_cancelled() => {
                    let message = format!("cancelled: {e:#}");
                    self.finish_attempt(
                        attempt_id,
                        AttemptStatus::Failed,
                        0,
                        &message,
                        attempt as i32,
                        started,
                    )
                    .await;
                    return Err(e.context("attempt cancelled"));
                }
                Err(e) => {
                    warn!(job_id = job.id, attempt, error = %format!("{e:#}"), "attempt iteration failed");
                    last_error = Some(e);
                }
            }
        }

        let message = format!(
            "retried {} times: {:#}",
            policy.max_retries,
            last_error.as_ref().map(|e| format!("{e:#}")).unwrap_or_default()
        );
        self.finish_attempt(
            attempt_id,
            AttemptStatus::Failed,
            0,
            &message,
            policy.max_retries as i32,
            started,
        )
        .await;

        Err(last_error
            .unwrap_or_else(|| anyhow!("attempt failed"))
            .context(format!("job failed after {} retries", policy.max_retries)))
    }

    async fn finish_attempt(
        &self,
        attempt_id: i64,
        status: AttemptStatus,
        records_collected: i64,
        error_message: &str,
        retry_count: i32,
        started: std::time::Instant,
    ) {
        if let Err(e) = self
            .store
            .close_attempt(attempt_id, status, records_collected, error_message, retry_count)
            .await
        {
            error!(attempt_id, error = %format!("{e:#}"), "failed to close attempt record");
        }
        self.metrics
            .record_attempt(status.as_str(), started.elapsed(), records_collected as u64);
    }

    /// One pipeline run under the per-attempt timeout.
    async fn execute_once(
        &self,
        shutdown: &CancellationToken,
        job: &CollectionJob,
        task_config: &TaskConfig,
    ) -> Result<usize> {
        let attempt_cancel = shutdown.child_token();
        let budget = job.execution_timeout();

        match tokio::time::timeout(budget, self.run_pipeline(&attempt_cancel, job, task_config))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                attempt_cancel.cancel();
                bail!("attempt timed out after {budget:?}")
            }
        }
    }

    async fn run_pipeline(
        &self,
        cancel: &CancellationToken,
        job: &CollectionJob,
        task_config: &TaskConfig,
    ) -> Result<usize> {
        let collector = self
            .collectors
            .require(&task_config.data_source.source_type)?;
        let records = collector
            .collect(cancel, &task_config.data_source)
            .await
            .context("collection failed")?;
        debug!(job_id = job.id, records = records.len(), "collection finished");

        let mut processor = Processor::new(task_config.processor.clone());
        if let Some(dedup_config) = &task_config.processor.deduplication {
            processor = processor.with_deduplicator(self.deduplicator_for(job.id, dedup_config));
        }
        let processed = processor.process(records).context("processing failed")?;

        let sink = self.sinks.require(&task_config.storage.target)?;
        sink.store(cancel, &task_config.storage, &processed)
            .await
            .context("storage failed")?;

        Ok(processed.len())
    }

    fn deduplicator_for(
        &self,
        job_id: i64,
        config: &collection::config::DeduplicatorConfig,
    ) -> Arc<Deduplicator> {
        let mut map = self.deduplicators.lock().expect("dedup map lock");
        map.entry(job_id)
            .or_insert_with(|| Deduplicator::new(config.clone()))
            .clone()
    }

    /// Stored config wins; otherwise synthesize one from the referenced
    /// data source.
    async fn resolve_task_config(&self, job: &CollectionJob) -> Result<TaskConfig> {
        if let Some(raw) = job.config.as_deref().filter(|c| !c.trim().is_empty()) {
            return serde_json::from_str(raw).context("job config is not valid task config JSON");
        }

        let Some(data_source_id) = job.data_source_id else {
            bail!("job {} has neither a config nor a data source", job.id);
        };

        let (source_type, source_config) =
            self.store.resolve_data_source(data_source_id).await?;

        synthesize_task_config(
            job.id,
            &source_type,
            &source_config,
            &self.config.default_storage_target,
            &self.config.collected_database,
        )
    }
}

/// True when any cause in the chain is a cancellation.
fn error_is_cancellation(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        matches!(cause.downcast_ref(), Some(CollectError::Cancelled))
            || matches!(cause.downcast_ref(), Some(StoreError::Cancelled))
    })
}

/// Build a default task config from a data source row: carry over
/// url/endpoint, headers, selectors, and the collector-specific
/// sub-config; store into `collected_<type>_<job_id>`.
fn synthesize_task_config(
    job_id: i64,
    source_type: &str,
    source_config: &Value,
    default_target: &str,
    collected_database: &str,
) -> Result<TaskConfig> {
    let object = source_config
        .as_object()
        .context("data source config is not a JSON object")?;

    let text = |key: &str| -> Option<String> {
        object.get(key).and_then(Value::as_str).map(str::to_string)
    };

    let mut data_source = DataSourceConfig {
        source_type: source_type.to_string(),
        url: text("url").or_else(|| text("endpoint")).unwrap_or_default(),
        method: text("method").unwrap_or_else(|| "GET".to_string()),
        ..DataSourceConfig::default()
    };

    if let Some(headers) = object.get("headers") {
        data_source.headers = serde_json::from_value(headers.clone())
            .context("data source headers are not a string map")?;
    }
    if let Some(selectors) = object.get("selectors") {
        data_source.selectors = serde_json::from_value(selectors.clone())
            .context("data source selectors are not a string map")?;
    }
    if source_type == "web-rpa" {
        if let Some(rpa) = object.get("rpa_config") {
            data_source.rpa_config = Some(
                serde_json::from_value(rpa.clone()).context("invalid rpa_config on data source")?,
            );
        }
    }
    if source_type == "database" {
        let db = object.get("db_config").unwrap_or(source_config);
        data_source.db_config =
            Some(serde_json::from_value(db.clone()).context("invalid db_config on data source")?);
    }

    let table = format!("collected_{}_{}", source_type.replace('-', "_"), job_id);

    Ok(TaskConfig {
        data_source,
        processor: Default::default(),
        storage: StorageConfig {
            target: default_target.to_string(),
            database: collected_database.to_string(),
            table,
            mapping: Default::default(),
        },
    })
}

/// Worker identity: `POD_NAME`, or a synthesized `worker-<unix_seconds>`
/// resolved once at start.
pub fn worker_identity() -> String {
    std::env::var("POD_NAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("worker-{}", Utc::now().timestamp()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::testing::{CancellingCollector, MemoryJobStore, RecordingSink, ScriptedCollector};
    use chrono::Duration as ChronoDuration;
    use collection::record::record_from;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn task_config_json() -> String {
        json!({
            "data_source": {"type": "scripted", "url": "memory://source"},
            "storage": {"target": "memory", "database": "out", "table": "records"}
        })
        .to_string()
    }

    fn due_job(id: i64, cron: Option<&str>) -> CollectionJob {
        CollectionJob {
            id,
            name: format!("job-{id}"),
            job_type: "api".to_string(),
            status: JobStatus::Enabled,
            data_source_id: None,
            cron: cron.map(str::to_string),
            next_run_time: Some(Utc::now() - ChronoDuration::seconds(1)),
            replicas: 0,
            execution_timeout: 30,
            max_retries: 0,
            config: Some(task_config_json()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct Harness {
        store: Arc<MemoryJobStore>,
        sink: Arc<RecordingSink>,
        scheduler: Scheduler<MemoryJobStore>,
    }

    fn harness(collector: Arc<dyn collection::traits::Collector>) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let sink = Arc::new(RecordingSink::new());

        let mut collectors = CollectorRegistry::new();
        collectors.register(collector);
        let mut sinks = SinkRegistry::new();
        sinks.register(sink.clone());

        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(collectors),
            Arc::new(sinks),
            Arc::new(WorkerMetrics::new().unwrap()),
            SchedulerConfig {
                worker_type: "api".to_string(),
                poll_interval: Duration::from_secs(30),
                worker_identity: "worker-test".to_string(),
                default_storage_target: "memory".to_string(),
                collected_database: "collected_data".to_string(),
            },
        );

        Harness {
            store,
            sink,
            scheduler,
        }
    }

    fn sample_records() -> Vec<collection::record::Record> {
        vec![
            record_from([("id", json!(1)), ("name", json!("Alice"))]),
            record_from([("id", json!(2)), ("name", json!("Bob"))]),
        ]
    }

    #[tokio::test]
    async fn test_happy_path_records_one_success_attempt() {
        let h = harness(Arc::new(ScriptedCollector::succeeding(
            "scripted",
            sample_records(),
        )));
        h.store.insert_job(due_job(1, Some("*/5 * * * *")));

        let picked_at = Utc::now();
        h.scheduler.poll(&CancellationToken::new()).await;

        let attempts = h.store.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Success);
        assert_eq!(attempts[0].records_collected, 2);
        assert_eq!(attempts[0].worker_identity, "worker-test");
        assert!(attempts[0].end_time.unwrap() >= attempts[0].start_time);

        let batches = h.sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 2);

        // Cron reschedule, strictly in the future.
        let job = h.store.job(1).unwrap();
        assert!(job.next_run_time.unwrap() > picked_at);
    }

    #[tokio::test]
    async fn test_lease_contention_yields_single_attempt() {
        let h = harness(Arc::new(ScriptedCollector::succeeding(
            "scripted",
            sample_records(),
        )));
        h.store.insert_job(due_job(1, None));

        // A racing worker takes the lease first.
        assert!(h.store.try_lease(1).await.unwrap());
        assert!(!h.store.try_lease(1).await.unwrap());

        // This worker's poll sees nothing due anymore.
        h.scheduler.poll(&CancellationToken::new()).await;
        assert!(h.store.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_succeed_keeps_one_attempt_row() {
        let collector = Arc::new(ScriptedCollector::new("scripted", 2, sample_records()));
        let h = harness(collector.clone());
        let mut job = due_job(1, Some("*/5 * * * *"));
        job.max_retries = 3;
        h.store.insert_job(job);

        h.scheduler.poll(&CancellationToken::new()).await;

        assert_eq!(collector.calls.load(Ordering::SeqCst), 3);
        let attempts = h.store.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Success);
        assert_eq!(attempts[0].records_collected, 2);
        assert_eq!(attempts[0].retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_records_failure() {
        let collector = Arc::new(ScriptedCollector::new("scripted", u32::MAX, Vec::new()));
        let h = harness(collector);
        let mut job = due_job(1, Some("*/5 * * * *"));
        job.max_retries = 2;
        h.store.insert_job(job);

        let picked_at = Utc::now();
        h.scheduler.poll(&CancellationToken::new()).await;

        let attempts = h.store.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert_eq!(attempts[0].retry_count, 2);
        assert!(attempts[0].error_message.contains("retried 2 times"));

        // Still advanced by cron despite the failure.
        let job = h.store.job(1).unwrap();
        assert!(job.next_run_time.unwrap() > picked_at);
    }

    #[tokio::test]
    async fn test_one_shot_job_is_parked_after_success() {
        let h = harness(Arc::new(ScriptedCollector::succeeding(
            "scripted",
            sample_records(),
        )));
        h.store.insert_job(due_job(1, None));

        h.scheduler.poll(&CancellationToken::new()).await;

        assert_eq!(h.store.attempts().len(), 1);
        assert!(h.store.job(1).unwrap().next_run_time.is_none());

        // Parked job is not picked up again.
        h.scheduler.poll(&CancellationToken::new()).await;
        assert_eq!(h.store.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_closes_attempt_without_retry() {
        let shutdown = CancellationToken::new();
        let h = harness(Arc::new(CancellingCollector::new(
            "scripted",
            shutdown.clone(),
        )));
        let mut job = due_job(1, None);
        job.max_retries = 3;
        h.store.insert_job(job);

        h.scheduler.poll(&shutdown).await;

        let attempts = h.store.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert!(attempts[0].error_message.contains("cancelled"));
        assert_eq!(attempts[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_bad_stored_config_fails_without_retry_iterations() {
        let collector = Arc::new(ScriptedCollector::succeeding("scripted", Vec::new()));
        let h = harness(collector.clone());
        let mut job = due_job(1, None);
        job.config = Some("{not json".to_string());
        h.store.insert_job(job);

        h.scheduler.poll(&CancellationToken::new()).await;

        let attempts = h.store.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert!(attempts[0].error_message.contains("task config"));
        assert_eq!(collector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_config_synthesis_from_data_source() {
        let h = harness(Arc::new(ScriptedCollector::succeeding(
            "scripted",
            sample_records(),
        )));

        let mut job = due_job(7, None);
        job.config = None;
        job.data_source_id = Some(42);
        h.store.insert_job(job);
        h.store.insert_data_source(
            42,
            "scripted",
            json!({
                "url": "https://api.example.com/items",
                "headers": {"Authorization": "Bearer t"},
                "selectors": {"_data_path": "@this", "id": "id"}
            }),
        );

        h.scheduler.poll(&CancellationToken::new()).await;

        let attempts = h.store.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Success);

        let batches = h.sink.batches();
        assert_eq!(batches[0].0.table, "collected_scripted_7");
        assert_eq!(batches[0].0.database, "collected_data");
    }

    #[tokio::test]
    async fn test_dedup_stage_filters_across_pipeline() {
        let records = vec![
            record_from([("id", json!(1)), ("email", json!("a@x.com"))]),
            record_from([("id", json!(2)), ("email", json!("b@x.com"))]),
            record_from([("id", json!(3)), ("email", json!("a@x.com"))]),
        ];
        let h = harness(Arc::new(ScriptedCollector::succeeding("scripted", records)));

        let mut job = due_job(1, None);
        job.config = Some(
            json!({
                "data_source": {"type": "scripted", "url": "memory://source"},
                "processor": {
                    "deduplication": {"strategy": "field_based", "fields": ["email"]}
                },
                "storage": {"target": "memory", "database": "out", "table": "records"}
            })
            .to_string(),
        );
        h.store.insert_job(job);

        h.scheduler.poll(&CancellationToken::new()).await;

        let attempts = h.store.attempts();
        assert_eq!(attempts[0].records_collected, 2);
        assert_eq!(h.sink.batches()[0].1.len(), 2);
    }

    #[test]
    fn test_synthesize_task_config_shapes() {
        let config = synthesize_task_config(
            9,
            "web-rpa",
            &json!({
                "url": "https://example.com/list",
                "selectors": {"_list": ".row", "name": ".name"},
                "rpa_config": {"check_selector": ".logged-in"}
            }),
            "file",
            "collected_data",
        )
        .unwrap();

        assert_eq!(config.data_source.source_type, "web-rpa");
        assert_eq!(config.data_source.url, "https://example.com/list");
        assert_eq!(
            config.data_source.rpa_config.unwrap().check_selector.unwrap(),
            ".logged-in"
        );
        assert_eq!(config.storage.table, "collected_web_rpa_9");
        assert_eq!(config.storage.target, "file");
    }

    #[test]
    fn test_synthesize_uses_endpoint_fallback() {
        let config = synthesize_task_config(
            3,
            "api",
            &json!({"endpoint": "https://api.example.com/v1"}),
            "file",
            "collected_data",
        )
        .unwrap();

        assert_eq!(config.data_source.url, "https://api.example.com/v1");
        assert_eq!(config.data_source.method, "GET");
        assert_eq!(config.storage.table, "collected_api_3");
    }

    #[test]
    fn test_worker_identity_fallback_shape() {
        // POD_NAME is unset in tests; the synthesized form is stable.
        if std::env::var("POD_NAME").is_err() {
            assert!(worker_identity().starts_with("worker-"));
        }
    }
}
