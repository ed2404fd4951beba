//! Job and batch models for documentation ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "ingest_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether the job has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// How a job's source should be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "scrape_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScrapeType {
    /// An HTML page fetched over HTTP, converted to Markdown.
    #[default]
    WebPage,
    /// An OpenAPI/JSON/YAML spec fetched verbatim.
    ApiSpec,
    /// A file from a local repository checkout.
    RepoTree,
}

/// One unit of ingestion work: a single URL or file reference.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: i64,
    pub batch_id: String,
    pub source_url: String,
    pub scrape_type: ScrapeType,
    pub status: JobStatus,
    /// Set iff status is `Failed`.
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Build a pending job for a batch. The id is assigned on insert;
    /// callers that seed in-memory stores pick their own.
    pub fn pending(id: i64, batch_id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            id,
            batch_id: batch_id.into(),
            source_url: source_url.into(),
            scrape_type: ScrapeType::default(),
            status: JobStatus::Pending,
            error_message: None,
            processed_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Derived per-batch counts, always recomputable from the member jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchSummary {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl BatchSummary {
    /// Fold one job into the counts.
    pub fn count(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    /// Compute counts from a slice of jobs.
    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut summary = Self::default();
        for job in jobs {
            summary.count(job.status);
        }
        summary
    }

    /// The invariant every observation must satisfy.
    pub fn is_consistent(&self) -> bool {
        self.total == self.pending + self.processing + self.completed + self.failed
    }
}

/// A named group of jobs submitted and scheduled together.
///
/// The batch id doubles as the pool's admission-control key.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Batch {
    pub id: String,
    /// Optional higher-level grouping (e.g. the library the docs belong to);
    /// events for the batch are also published under this scope.
    pub library: Option<String>,
    pub created_at: DateTime<Utc>,
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl Batch {
    pub fn new(id: impl Into<String>, library: Option<String>) -> Self {
        Self {
            id: id.into(),
            library,
            created_at: Utc::now(),
            total: 0,
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
        }
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            total: self.total,
            pending: self.pending,
            processing: self.processing,
            completed: self.completed,
            failed: self.failed,
        }
    }

    pub fn apply_summary(&mut self, summary: BatchSummary) {
        self.total = summary.total;
        self.pending = summary.pending;
        self.processing = summary.processing;
        self.completed = summary.completed;
        self.failed = summary.failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn summary_counts_from_jobs() {
        let mut jobs = vec![
            Job::pending(1, "b1", "https://docs.example.com/a"),
            Job::pending(2, "b1", "https://docs.example.com/b"),
            Job::pending(3, "b1", "https://docs.example.com/c"),
        ];
        jobs[1].status = JobStatus::Completed;
        jobs[2].status = JobStatus::Failed;

        let summary = BatchSummary::from_jobs(&jobs);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.is_consistent());
    }

    #[test]
    fn batch_summary_roundtrip() {
        let mut batch = Batch::new("b1", Some("example-docs".into()));
        let mut summary = BatchSummary::default();
        summary.count(JobStatus::Pending);
        summary.count(JobStatus::Processing);

        batch.apply_summary(summary);
        assert_eq!(batch.summary(), summary);
        assert!(batch.summary().is_consistent());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");

        let json = serde_json::to_string(&ScrapeType::WebPage).unwrap();
        assert_eq!(json, "\"web_page\"");
    }
}
