//! Admission control for batch processing.
//!
//! `JobService` is the public gate in front of the worker pool: it decides
//! whether a requested batch starts a new worker, is already running, or
//! must wait for capacity. Rejections are expected outcomes, returned as
//! values — never errors.

use tracing::{info, warn};

use super::pool::{PoolStatus, SpawnOutcome, WorkerPool};

/// Result of a batch submission.
///
/// `Duplicate` is success-equivalent (no data lost; poll existing
/// progress). `CapacityExceeded` is transient; retry later.
/// `ShuttingDown` is terminal for this process; stop submitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new worker was started for this batch.
    Accepted,
    /// A worker for this batch id is already running.
    Duplicate,
    /// All worker slots are taken.
    CapacityExceeded,
    /// The pool is shutting down.
    ShuttingDown,
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }

    /// Whether the caller should retry the same submission later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitOutcome::CapacityExceeded)
    }

    /// Human-readable outcome for transport layers to surface.
    pub fn message(&self, batch_id: &str) -> String {
        match self {
            SubmitOutcome::Accepted => format!("batch {batch_id} accepted for processing"),
            SubmitOutcome::Duplicate => format!("batch {batch_id} is already being processed"),
            SubmitOutcome::CapacityExceeded => {
                format!("batch {batch_id} rejected: all worker slots are busy, try again later")
            }
            SubmitOutcome::ShuttingDown => {
                format!("batch {batch_id} rejected: server is shutting down")
            }
        }
    }
}

/// Public-facing batch manager over the worker pool.
#[derive(Clone)]
pub struct JobService {
    pool: WorkerPool,
}

impl JobService {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }

    /// Request processing of a batch.
    ///
    /// The batch must already exist in the job store with pending jobs;
    /// creating it is the ingestion request handler's concern. The
    /// duplicate and capacity checks are atomic with worker registration,
    /// so two concurrent submissions can never both take the last slot.
    pub fn submit_batch(&self, batch_id: &str) -> SubmitOutcome {
        let outcome = match self.pool.spawn_worker(batch_id) {
            SpawnOutcome::Spawned => SubmitOutcome::Accepted,
            SpawnOutcome::Duplicate => SubmitOutcome::Duplicate,
            SpawnOutcome::AtCapacity => SubmitOutcome::CapacityExceeded,
            SpawnOutcome::ShuttingDown => SubmitOutcome::ShuttingDown,
        };

        match outcome {
            SubmitOutcome::Accepted => {
                info!(batch_id = %batch_id, "batch accepted");
            }
            SubmitOutcome::Duplicate => {
                info!(batch_id = %batch_id, "batch already in progress");
            }
            SubmitOutcome::CapacityExceeded | SubmitOutcome::ShuttingDown => {
                warn!(batch_id = %batch_id, outcome = ?outcome, "batch rejected");
            }
        }

        outcome
    }

    /// Read-only snapshot of the pool for observability.
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::pool::PoolConfig;
    use crate::kernel::jobs::testing::{InMemoryJobStore, ScriptMode, ScriptedWorker};
    use crate::kernel::stream_hub::StreamHub;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn service(store: Arc<InMemoryJobStore>, mode: ScriptMode, max: usize) -> JobService {
        let worker = Arc::new(ScriptedWorker::new(Arc::clone(&store), mode));
        let pool = WorkerPool::new(
            store,
            StreamHub::new(),
            worker,
            PoolConfig {
                max_concurrent_batches: max,
                shutdown_timeout: Duration::from_millis(500),
            },
        );
        JobService::new(pool)
    }

    #[tokio::test]
    async fn submit_then_resubmit_yields_accepted_then_duplicate() {
        let store = Arc::new(InMemoryJobStore::new());
        store.seed_batch("b1", &["https://a"]);

        let gate = Arc::new(Notify::new());
        let svc = service(
            Arc::clone(&store),
            ScriptMode::WaitThenComplete(Arc::clone(&gate)),
            1,
        );

        assert_eq!(svc.submit_batch("b1"), SubmitOutcome::Accepted);
        assert_eq!(svc.submit_batch("b1"), SubmitOutcome::Duplicate);

        let status = svc.pool_status();
        assert_eq!(status.active_batches, 1);
        assert!(!status.is_shutting_down);
    }

    #[tokio::test]
    async fn full_pool_rejects_with_capacity_exceeded() {
        let store = Arc::new(InMemoryJobStore::new());
        store.seed_batch("b1", &["https://a"]);
        store.seed_batch("b2", &["https://b"]);

        let gate = Arc::new(Notify::new());
        let svc = service(
            Arc::clone(&store),
            ScriptMode::WaitThenComplete(gate),
            1,
        );

        assert_eq!(svc.submit_batch("b1"), SubmitOutcome::Accepted);
        let outcome = svc.submit_batch("b2");
        assert_eq!(outcome, SubmitOutcome::CapacityExceeded);
        assert!(outcome.is_retryable());
        assert_eq!(svc.pool_status().active_batches, 1);
    }

    #[test]
    fn outcome_messages_distinguish_rejections() {
        assert!(SubmitOutcome::Duplicate
            .message("b1")
            .contains("already being processed"));
        assert!(SubmitOutcome::CapacityExceeded
            .message("b1")
            .contains("try again later"));
        assert!(SubmitOutcome::ShuttingDown
            .message("b1")
            .contains("shutting down"));
        assert!(!SubmitOutcome::Duplicate.is_retryable());
    }
}
