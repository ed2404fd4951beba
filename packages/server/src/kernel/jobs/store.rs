//! Job store contract and its PostgreSQL implementation.
//!
//! The store is the durable source of truth for jobs and batches; the
//! worker pool only ever mutates it through this interface. Every call is
//! independently atomic — the summary recompute in particular is a single
//! UPDATE so observers never see torn counts.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;

use super::job::{Batch, BatchSummary, Job, JobStatus};

/// Error reason recorded on jobs orphaned by a worker that died.
pub const WORKER_TERMINATED_REASON: &str = "worker terminated abnormally";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch {0} not found")]
    BatchNotFound(String),
}

/// Durable record of jobs and batches.
///
/// Status writes for deleted jobs are no-ops: an operator may delete a job
/// while its batch is in flight, and the worker's late result for it is
/// simply discarded on arrival.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find_job(&self, id: i64) -> Result<Option<Job>>;

    async fn find_batch(&self, batch_id: &str) -> Result<Option<Batch>>;

    /// All jobs belonging to a batch, in insertion order.
    async fn batch_jobs(&self, batch_id: &str) -> Result<Vec<Job>>;

    /// Whether the batch exists and still has pending jobs.
    async fn has_pending_jobs(&self, batch_id: &str) -> Result<bool>;

    /// Record a job status transition. Unknown job ids are ignored.
    async fn write_job_status(
        &self,
        id: i64,
        status: JobStatus,
        processed_at: Option<DateTime<Utc>>,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Fail every pending/processing job of a batch with the given reason.
    ///
    /// Used when a worker dies: the store must never be left holding a
    /// `processing` row with no owning worker. Returns the number of jobs
    /// transitioned.
    async fn fail_incomplete_jobs(&self, batch_id: &str, reason: &str) -> Result<u64>;

    /// Recompute the batch's summary counts from its member jobs and
    /// persist them atomically.
    async fn recompute_summary(&self, batch_id: &str) -> Result<BatchSummary>;
}

/// PostgreSQL-backed job store.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fail `processing` rows left over from a previous supervisor run.
    ///
    /// Called once at startup, before any batch is admitted: a row still in
    /// `processing` at that point has no owning worker by definition.
    pub async fn recover_orphaned_jobs(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'failed',
                error_message = $1,
                processed_at = NOW()
            WHERE status = 'processing'
            "#,
        )
        .bind(WORKER_TERMINATED_REASON)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn find_job(&self, id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT id, batch_id, source_url, scrape_type, status,
                   error_message, processed_at, created_at
            FROM ingest_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn find_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        let batch = sqlx::query_as::<_, Batch>(
            r#"
            SELECT id, library, created_at, total, pending, processing, completed, failed
            FROM ingest_batches
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(batch)
    }

    async fn batch_jobs(&self, batch_id: &str) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT id, batch_id, source_url, scrape_type, status,
                   error_message, processed_at, created_at
            FROM ingest_jobs
            WHERE batch_id = $1
            ORDER BY id
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn has_pending_jobs(&self, batch_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM ingest_jobs
            WHERE batch_id = $1 AND status = 'pending'
            "#,
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn write_job_status(
        &self,
        id: i64,
        status: JobStatus,
        processed_at: Option<DateTime<Utc>>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = $2,
                processed_at = $3,
                error_message = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(processed_at)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_incomplete_jobs(&self, batch_id: &str, reason: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'failed',
                error_message = $2,
                processed_at = NOW()
            WHERE batch_id = $1
              AND status IN ('pending', 'processing')
            "#,
        )
        .bind(batch_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn recompute_summary(&self, batch_id: &str) -> Result<BatchSummary> {
        // Single statement so the counts can never be observed torn.
        let row: Option<(i64, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            UPDATE ingest_batches b
            SET total = c.total,
                pending = c.pending,
                processing = c.processing,
                completed = c.completed,
                failed = c.failed
            FROM (
                SELECT COUNT(*) AS total,
                       COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                       COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                       COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                       COUNT(*) FILTER (WHERE status = 'failed') AS failed
                FROM ingest_jobs
                WHERE batch_id = $1
            ) c
            WHERE b.id = $1
            RETURNING b.total, b.pending, b.processing, b.completed, b.failed
            "#,
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        let (total, pending, processing, completed, failed) =
            row.ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;

        Ok(BatchSummary {
            total,
            pending,
            processing,
            completed,
            failed,
        })
    }
}
