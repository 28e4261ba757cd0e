//! Control store: typed access to job rows, lease primitives, and
//! execution history.
//!
//! Every operation is a single SQL statement; there are no in-process
//! locks and no retries here. Errors propagate verbatim and the
//! scheduler decides recovery.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::job::{AttemptStatus, CollectionJob, JobStatus};

/// How many due jobs one poll tick may pick up.
const DUE_JOBS_LIMIT: i64 = 10;

/// Operations the scheduler needs from the control database.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Due, enabled jobs of this worker's type, oldest `next_run_time`
    /// first, capped at 10. Jobs whose running attempt count has reached
    /// `replicas` are excluded (advisory concurrency bound).
    async fn list_due_jobs(&self, worker_type: &str) -> Result<Vec<CollectionJob>>;

    /// Atomically advance `next_run_time` by one hour iff the job is
    /// still due. Returns whether this writer won the lease. The
    /// advanced time doubles as a self-expiring lease if the worker
    /// crashes mid-attempt.
    async fn try_lease(&self, job_id: i64) -> Result<bool>;

    /// Insert a running history row; returns its id.
    async fn open_attempt(&self, job_id: i64, worker_identity: &str) -> Result<i64>;

    /// Finalize a history row. Terminal status and `end_time` are
    /// written together, exactly once.
    async fn close_attempt(
        &self,
        attempt_id: i64,
        status: AttemptStatus,
        records_collected: i64,
        error_message: &str,
        retry_count: i32,
    ) -> Result<()>;

    /// Set `next_run_time` absolutely (cron jobs after an attempt).
    async fn reschedule_next(&self, job_id: i64, next_time: DateTime<Utc>) -> Result<()>;

    /// Park the job (one-shot jobs after an attempt).
    async fn clear_next(&self, job_id: i64) -> Result<()>;

    /// Type tag and config JSON of a data source, for task-config
    /// synthesis.
    async fn resolve_data_source(&self, data_source_id: i64) -> Result<(String, serde_json::Value)>;
}

/// sqlx implementation against the control database.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn list_due_jobs(&self, worker_type: &str) -> Result<Vec<CollectionJob>> {
        let rows = sqlx::query(
            r#"
            SELECT j.id, j.name, j.type, j.status, j.data_source_id, j.cron,
                   j.next_run_time, j.replicas, j.execution_timeout, j.max_retries,
                   j.config, j.created_at, j.updated_at
            FROM collection_jobs j
            WHERE j.status = 'enabled'
              AND j.type = $1
              AND j.next_run_time IS NOT NULL
              AND j.next_run_time <= NOW()
              AND (SELECT COUNT(*) FROM job_executions e
                   WHERE e.job_id = j.id AND e.status = 'running')
                  < GREATEST(j.replicas, 1)
            ORDER BY j.next_run_time ASC
            LIMIT $2
            "#,
        )
        .bind(worker_type)
        .bind(DUE_JOBS_LIMIT)
        .fetch_all(&self.pool)
        .await
        .context("failed to list due jobs")?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    async fn try_lease(&self, job_id: i64) -> Result<bool> {
        // Single conditional UPDATE; a read-then-write would race other
        // workers.
        let result = sqlx::query(
            r#"
            UPDATE collection_jobs
            SET next_run_time = NOW() + INTERVAL '1 hour', updated_at = NOW()
            WHERE id = $1
              AND status = 'enabled'
              AND next_run_time IS NOT NULL
              AND next_run_time <= NOW()
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("failed to lease job")?;

        Ok(result.rows_affected() == 1)
    }

    async fn open_attempt(&self, job_id: i64, worker_identity: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_executions
                (job_id, worker_identity, status, start_time, records_collected,
                 error_message, retry_count)
            VALUES ($1, $2, 'running', NOW(), 0, '', 0)
            RETURNING id
            "#,
        )
        .bind(job_id)
        .bind(worker_identity)
        .fetch_one(&self.pool)
        .await
        .context("failed to open execution attempt")?;

        Ok(row.get("id"))
    }

    async fn close_attempt(
        &self,
        attempt_id: i64,
        status: AttemptStatus,
        records_collected: i64,
        error_message: &str,
        retry_count: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_executions
            SET status = $1, end_time = NOW(), records_collected = $2,
                error_message = $3, retry_count = $4
            WHERE id = $5
            "#,
        )
        .bind(status.as_str())
        .bind(records_collected)
        .bind(error_message)
        .bind(retry_count)
        .bind(attempt_id)
        .execute(&self.pool)
        .await
        .context("failed to close execution attempt")?;

        Ok(())
    }

    async fn reschedule_next(&self, job_id: i64, next_time: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE collection_jobs SET next_run_time = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(next_time)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("failed to reschedule job")?;

        Ok(())
    }

    async fn clear_next(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE collection_jobs SET next_run_time = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("failed to clear job schedule")?;

        Ok(())
    }

    async fn resolve_data_source(
        &self,
        data_source_id: i64,
    ) -> Result<(String, serde_json::Value)> {
        let row = sqlx::query("SELECT type, config FROM data_sources WHERE id = $1")
            .bind(data_source_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to resolve data source {data_source_id}"))?;

        let source_type: String = row.get("type");
        let raw: String = row.get("config");
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("data source {data_source_id} has invalid config JSON"))?;

        Ok((source_type, config))
    }
}

fn row_to_job(row: &PgRow) -> CollectionJob {
    let status: String = row.get("status");
    CollectionJob {
        id: row.get("id"),
        name: row.get("name"),
        job_type: row.get("type"),
        status: JobStatus::parse(&status),
        data_source_id: row.get("data_source_id"),
        cron: row.get("cron"),
        next_run_time: row.get("next_run_time"),
        replicas: row.get("replicas"),
        execution_timeout: row.get("execution_timeout"),
        max_retries: row.get("max_retries"),
        config: row.get("config"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
