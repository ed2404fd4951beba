//! Worker contract and the production scrape worker.
//!
//! A worker is an isolated execution unit owning one batch. It reports
//! every job transition as a [`WorkerMessage`] and signals clean completion
//! with [`WorkerMessage::Finished`]; any other ending (error return, panic,
//! channel close) is treated as a crash by the supervising pool. Workers
//! never write the job store themselves — the pool relays their messages.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::job::{Job, JobStatus, ScrapeType};
use super::store::JobStore;
use crate::kernel::scraper::PageScraper;

/// Progress reported by a worker to its supervisor, in execution order.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    BatchStarted { total_jobs: usize },
    JobStarted { job_id: i64 },
    JobCompleted { job_id: i64 },
    JobFailed { job_id: i64, error: String },
    /// All assigned jobs reached a terminal state; the worker is exiting
    /// cleanly. A worker that ends without this message crashed.
    Finished,
}

/// One batch's execution unit.
///
/// Launched with the batch id as its sole required context. Runs inside a
/// spawned task whose join handle gives the pool a panic boundary: a panic
/// here cannot corrupt the supervisor's bookkeeping.
#[async_trait]
pub trait BatchWorker: Send + Sync {
    async fn run(
        &self,
        batch_id: &str,
        messages: mpsc::Sender<WorkerMessage>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Destination for ingested content. Chunking/indexing happens downstream.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn store_document(&self, job: &Job, content: &str) -> Result<()>;
}

/// Sink that writes one Markdown file per job under `{dir}/{batch}/{job}.md`.
pub struct MarkdownDirSink {
    dir: PathBuf,
}

impl MarkdownDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DocumentSink for MarkdownDirSink {
    async fn store_document(&self, job: &Job, content: &str) -> Result<()> {
        let batch_dir = self.dir.join(&job.batch_id);
        tokio::fs::create_dir_all(&batch_dir)
            .await
            .with_context(|| format!("failed to create {}", batch_dir.display()))?;

        let path = batch_dir.join(format!("{}.md", job.id));
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        Ok(())
    }
}

/// Production worker: processes each pending job of its batch sequentially.
pub struct ScrapeWorker {
    store: Arc<dyn JobStore>,
    scraper: Arc<PageScraper>,
    sink: Arc<dyn DocumentSink>,
}

impl ScrapeWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        scraper: Arc<PageScraper>,
        sink: Arc<dyn DocumentSink>,
    ) -> Self {
        Self {
            store,
            scraper,
            sink,
        }
    }

    async fn process_job(&self, job: &Job) -> Result<()> {
        let content = match job.scrape_type {
            ScrapeType::WebPage => {
                let page = self.scraper.scrape_page(&job.source_url).await?;
                match page.title {
                    Some(title) => format!("# {title}\n\n{}", page.markdown),
                    None => page.markdown,
                }
            }
            ScrapeType::ApiSpec => self.scraper.fetch_raw(&job.source_url).await?,
            ScrapeType::RepoTree => tokio::fs::read_to_string(&job.source_url)
                .await
                .with_context(|| format!("failed to read {}", job.source_url))?,
        };

        self.sink.store_document(job, &content).await
    }
}

#[async_trait]
impl BatchWorker for ScrapeWorker {
    async fn run(
        &self,
        batch_id: &str,
        messages: mpsc::Sender<WorkerMessage>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let jobs: Vec<Job> = self
            .store
            .batch_jobs(batch_id)
            .await?
            .into_iter()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();

        messages
            .send(WorkerMessage::BatchStarted {
                total_jobs: jobs.len(),
            })
            .await?;

        for job in &jobs {
            if cancel.is_cancelled() {
                // Remaining jobs are reconciled to failed by the pool.
                anyhow::bail!("worker for batch {batch_id} stopped before completing its jobs");
            }

            messages
                .send(WorkerMessage::JobStarted { job_id: job.id })
                .await?;

            match self.process_job(job).await {
                Ok(()) => {
                    debug!(batch_id = %batch_id, job_id = job.id, "job completed");
                    messages
                        .send(WorkerMessage::JobCompleted { job_id: job.id })
                        .await?;
                }
                Err(e) => {
                    warn!(batch_id = %batch_id, job_id = job.id, error = %e, "job failed");
                    messages
                        .send(WorkerMessage::JobFailed {
                            job_id: job.id,
                            error: e.to_string(),
                        })
                        .await?;
                }
            }
        }

        messages.send(WorkerMessage::Finished).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::testing::InMemoryJobStore;
    use std::time::Duration;

    struct NullSink;

    #[async_trait]
    impl DocumentSink for NullSink {
        async fn store_document(&self, _job: &Job, _content: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_batch_finishes_cleanly() {
        let store = Arc::new(InMemoryJobStore::new());
        store.seed_batch("b1", &[]);

        let worker = ScrapeWorker::new(
            store,
            Arc::new(PageScraper::new(Duration::from_secs(1)).unwrap()),
            Arc::new(NullSink),
        );

        let (tx, mut rx) = mpsc::channel(8);
        worker
            .run("b1", tx, CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(WorkerMessage::BatchStarted { total_jobs: 0 })
        ));
        assert!(matches!(rx.recv().await, Some(WorkerMessage::Finished)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_worker_errors_without_finishing() {
        let store = Arc::new(InMemoryJobStore::new());
        store.seed_batch("b1", &["https://docs.example.com/a"]);

        let worker = ScrapeWorker::new(
            store,
            Arc::new(PageScraper::new(Duration::from_secs(1)).unwrap()),
            Arc::new(NullSink),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();

        let (tx, mut rx) = mpsc::channel(8);
        let result = worker.run("b1", tx, cancel).await;
        assert!(result.is_err());

        assert!(matches!(
            rx.recv().await,
            Some(WorkerMessage::BatchStarted { .. })
        ));
        // No Finished message on the cancelled path
        assert!(rx.recv().await.is_none());
    }
}
