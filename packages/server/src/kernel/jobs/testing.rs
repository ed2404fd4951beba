//! Job testing utilities: in-memory store and scripted workers.
//!
//! These doubles let the pool and service tests exercise the real
//! supervision paths without Postgres or the network.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use super::job::{Batch, BatchSummary, Job, JobStatus};
use super::store::JobStore;
use super::worker::{BatchWorker, WorkerMessage};

#[derive(Default)]
struct StoreInner {
    jobs: BTreeMap<i64, Job>,
    batches: HashMap<String, Batch>,
    next_id: i64,
}

/// In-memory job store for tests.
pub struct InMemoryJobStore {
    inner: RwLock<StoreInner>,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a batch with one pending job per source url. Returns job ids.
    pub fn seed_batch(&self, batch_id: &str, source_urls: &[&str]) -> Vec<i64> {
        self.seed_batch_with_library(batch_id, None, source_urls)
    }

    pub fn seed_batch_with_library(
        &self,
        batch_id: &str,
        library: Option<&str>,
        source_urls: &[&str],
    ) -> Vec<i64> {
        let mut inner = self.write();
        inner.batches.insert(
            batch_id.to_string(),
            Batch::new(batch_id, library.map(String::from)),
        );

        let mut ids = Vec::with_capacity(source_urls.len());
        for url in source_urls {
            let id = inner.next_id;
            inner.next_id += 1;
            inner.jobs.insert(id, Job::pending(id, batch_id, *url));
            ids.push(id);
        }

        Self::recompute_locked(&mut inner, batch_id);
        ids
    }

    /// Delete a job out from under a running batch (operator action).
    pub fn delete_job(&self, id: i64) {
        let mut inner = self.write();
        if let Some(job) = inner.jobs.remove(&id) {
            Self::recompute_locked(&mut inner, &job.batch_id);
        }
    }

    pub fn job_status(&self, id: i64) -> Option<JobStatus> {
        self.read().jobs.get(&id).map(|j| j.status)
    }

    pub fn job_error(&self, id: i64) -> Option<String> {
        self.read().jobs.get(&id).and_then(|j| j.error_message.clone())
    }

    /// Statuses of a batch's jobs in id order.
    pub fn statuses(&self, batch_id: &str) -> Vec<JobStatus> {
        self.read()
            .jobs
            .values()
            .filter(|j| j.batch_id == batch_id)
            .map(|j| j.status)
            .collect()
    }

    fn recompute_locked(inner: &mut StoreInner, batch_id: &str) -> BatchSummary {
        let jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.batch_id == batch_id)
            .cloned()
            .collect();
        let summary = BatchSummary::from_jobs(&jobs);
        if let Some(batch) = inner.batches.get_mut(batch_id) {
            batch.apply_summary(summary);
        }
        summary
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn find_job(&self, id: i64) -> Result<Option<Job>> {
        Ok(self.read().jobs.get(&id).cloned())
    }

    async fn find_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        Ok(self.read().batches.get(batch_id).cloned())
    }

    async fn batch_jobs(&self, batch_id: &str) -> Result<Vec<Job>> {
        Ok(self
            .read()
            .jobs
            .values()
            .filter(|j| j.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn has_pending_jobs(&self, batch_id: &str) -> Result<bool> {
        Ok(self
            .read()
            .jobs
            .values()
            .any(|j| j.batch_id == batch_id && j.status == JobStatus::Pending))
    }

    async fn write_job_status(
        &self,
        id: i64,
        status: JobStatus,
        processed_at: Option<DateTime<Utc>>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.write();
        // Deleted jobs: late worker results are discarded
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.status = status;
            job.processed_at = processed_at;
            job.error_message = error_message.map(String::from);
        }
        Ok(())
    }

    async fn fail_incomplete_jobs(&self, batch_id: &str, reason: &str) -> Result<u64> {
        let mut inner = self.write();
        let now = Utc::now();
        let mut failed = 0;
        for job in inner.jobs.values_mut() {
            if job.batch_id == batch_id && !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.error_message = Some(reason.to_string());
                job.processed_at = Some(now);
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn recompute_summary(&self, batch_id: &str) -> Result<BatchSummary> {
        let mut inner = self.write();
        Ok(Self::recompute_locked(&mut inner, batch_id))
    }
}

/// What a [`ScriptedWorker`] should do with its batch.
#[derive(Clone)]
pub enum ScriptMode {
    /// Complete every pending job and finish cleanly.
    CompleteAll,
    /// Complete jobs until the given count, then panic.
    PanicAfter(usize),
    /// Report batch start, then return Ok without a Finished message.
    SilentExit,
    /// Report batch start, wait for cancellation, then error out.
    HangUntilCancelled,
    /// Report batch start and never return, ignoring cancellation.
    HangForever,
    /// Wait on the notify before completing all jobs (lets tests hold a
    /// batch active).
    WaitThenComplete(Arc<Notify>),
}

/// Worker double driven by a [`ScriptMode`].
pub struct ScriptedWorker {
    store: Arc<InMemoryJobStore>,
    mode: ScriptMode,
}

impl ScriptedWorker {
    pub fn new(store: Arc<InMemoryJobStore>, mode: ScriptMode) -> Self {
        Self { store, mode }
    }

    async fn pending_jobs(&self, batch_id: &str) -> Result<Vec<Job>> {
        Ok(self
            .store
            .batch_jobs(batch_id)
            .await?
            .into_iter()
            .filter(|j| j.status == JobStatus::Pending)
            .collect())
    }

    async fn complete_jobs(
        &self,
        jobs: &[Job],
        messages: &mpsc::Sender<WorkerMessage>,
    ) -> Result<()> {
        for job in jobs {
            messages
                .send(WorkerMessage::JobStarted { job_id: job.id })
                .await?;
            messages
                .send(WorkerMessage::JobCompleted { job_id: job.id })
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BatchWorker for ScriptedWorker {
    async fn run(
        &self,
        batch_id: &str,
        messages: mpsc::Sender<WorkerMessage>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let jobs = self.pending_jobs(batch_id).await?;
        messages
            .send(WorkerMessage::BatchStarted {
                total_jobs: jobs.len(),
            })
            .await?;

        match &self.mode {
            ScriptMode::CompleteAll => {
                self.complete_jobs(&jobs, &messages).await?;
                messages.send(WorkerMessage::Finished).await?;
                Ok(())
            }
            ScriptMode::PanicAfter(count) => {
                self.complete_jobs(&jobs[..(*count).min(jobs.len())], &messages)
                    .await?;
                panic!("scripted worker panic");
            }
            ScriptMode::SilentExit => Ok(()),
            ScriptMode::HangUntilCancelled => {
                cancel.cancelled().await;
                anyhow::bail!("worker for batch {batch_id} stopped before completing its jobs")
            }
            ScriptMode::HangForever => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            ScriptMode::WaitThenComplete(gate) => {
                gate.notified().await;
                self.complete_jobs(&jobs, &messages).await?;
                messages.send(WorkerMessage::Finished).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_batch_has_consistent_summary() {
        let store = InMemoryJobStore::new();
        store.seed_batch("b1", &["https://a", "https://b"]);

        let batch = store.find_batch("b1").await.unwrap().unwrap();
        assert_eq!(batch.total, 2);
        assert_eq!(batch.pending, 2);
        assert!(batch.summary().is_consistent());
    }

    #[tokio::test]
    async fn status_write_for_deleted_job_is_discarded() {
        let store = InMemoryJobStore::new();
        let ids = store.seed_batch("b1", &["https://a"]);
        store.delete_job(ids[0]);

        // Late worker result for the deleted job
        store
            .write_job_status(ids[0], JobStatus::Completed, Some(Utc::now()), None)
            .await
            .unwrap();

        assert!(store.find_job(ids[0]).await.unwrap().is_none());
        let summary = store.recompute_summary("b1").await.unwrap();
        assert_eq!(summary.total, 0);
        assert!(summary.is_consistent());
    }

    #[tokio::test]
    async fn fail_incomplete_leaves_terminal_jobs_alone() {
        let store = InMemoryJobStore::new();
        let ids = store.seed_batch("b1", &["https://a", "https://b", "https://c"]);
        store
            .write_job_status(ids[0], JobStatus::Completed, Some(Utc::now()), None)
            .await
            .unwrap();
        store
            .write_job_status(ids[1], JobStatus::Processing, None, None)
            .await
            .unwrap();

        let failed = store.fail_incomplete_jobs("b1", "boom").await.unwrap();
        assert_eq!(failed, 2);
        assert_eq!(store.job_status(ids[0]), Some(JobStatus::Completed));
        assert_eq!(store.job_status(ids[1]), Some(JobStatus::Failed));
        assert_eq!(store.job_status(ids[2]), Some(JobStatus::Failed));
    }
}
