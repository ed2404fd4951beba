//! Worker pool: isolated batch execution under a global concurrency ceiling.
//!
//! Each admitted batch runs in its own spawned worker task; the task's join
//! handle is the isolation boundary, so a worker panic can never corrupt
//! the pool's bookkeeping. A supervisor task per batch relays the worker's
//! progress messages into the job store and stream hub in arrival order,
//! then reconciles the exit exactly once:
//!
//! ```text
//! spawn_worker(batch_id)
//!     │  check duplicate / capacity / shutdown + register handle
//!     │  (one lock, so two submissions cannot both take the last slot)
//!     ├─► worker task ──► mpsc messages ──► supervisor task
//!     │                                        ├─► job store writes
//!     │                                        ├─► summary recompute
//!     │                                        └─► stream hub events
//!     └─► exit (clean | error | panic | abort) ──► reconcile
//! ```
//!
//! A worker that ends without reporting completion crashed: every one of
//! its non-terminal jobs is failed so the store is never left holding a
//! `processing` row with no owning worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::BatchEvent;
use super::store::{JobStore, WORKER_TERMINATED_REASON};
use super::worker::{BatchWorker, WorkerMessage};
use super::JobStatus;
use crate::kernel::stream_hub::StreamHub;

/// How long to wait for supervisors to reconcile after workers are
/// force-terminated.
const FORCE_REAP_GRACE: Duration = Duration::from_secs(2);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of simultaneously running batch workers.
    pub max_concurrent_batches: usize,
    /// Deadline for `shutdown()` before stragglers are force-terminated.
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_batches: 3,
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

/// Outcome of asking the pool to run a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// A worker was registered and launched for this batch.
    Spawned,
    /// A worker for this exact batch id is already running.
    Duplicate,
    /// The concurrency ceiling is reached; nothing was started.
    AtCapacity,
    /// The pool is shutting down and no longer accepts batches.
    ShuttingDown,
}

/// Read-only snapshot of the pool, taken under the state lock.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub active_batches: usize,
    pub running_batches: Vec<String>,
    pub is_shutting_down: bool,
}

/// Bookkeeping for one running worker. Owned exclusively by the pool.
struct WorkerHandle {
    cancel: CancellationToken,
    worker_abort: AbortHandle,
    started_at: Instant,
    /// Set by whichever reconciliation path claims the handle first;
    /// the other path backs off, so reclamation happens exactly once.
    reclaiming: bool,
}

#[derive(Default)]
struct PoolState {
    active: HashMap<String, WorkerHandle>,
    shutting_down: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    config: PoolConfig,
    store: Arc<dyn JobStore>,
    hub: StreamHub,
    worker: Arc<dyn BatchWorker>,
}

/// Exit classification for one worker.
enum WorkerExit {
    Clean,
    Crashed(String),
}

/// Supervises batch workers: admission, message relay, crash recovery,
/// graceful shutdown. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        hub: StreamHub,
        worker: Arc<dyn BatchWorker>,
        config: PoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                config,
                store,
                hub,
                worker,
            }),
        }
    }

    /// Admit a batch and launch its worker.
    ///
    /// The duplicate check, the capacity check, and the handle registration
    /// happen under one lock, and the handle is registered before any
    /// worker message is observed — an early exit cannot be missed.
    pub fn spawn_worker(&self, batch_id: &str) -> SpawnOutcome {
        let mut state = self.inner.lock_state();

        if state.shutting_down {
            return SpawnOutcome::ShuttingDown;
        }
        if state.active.contains_key(batch_id) {
            return SpawnOutcome::Duplicate;
        }
        if state.active.len() >= self.inner.config.max_concurrent_batches {
            return SpawnOutcome::AtCapacity;
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(64);

        let worker = Arc::clone(&self.inner.worker);
        let worker_batch_id = batch_id.to_string();
        let worker_cancel = cancel.clone();
        let worker_task = tokio::spawn(async move {
            worker.run(&worker_batch_id, tx, worker_cancel).await
        });

        state.active.insert(
            batch_id.to_string(),
            WorkerHandle {
                cancel,
                worker_abort: worker_task.abort_handle(),
                started_at: Instant::now(),
                reclaiming: false,
            },
        );
        drop(state);

        let inner = Arc::clone(&self.inner);
        let batch_id = batch_id.to_string();
        tokio::spawn(async move {
            inner.supervise(batch_id, worker_task, rx).await;
        });

        SpawnOutcome::Spawned
    }

    /// Consistent snapshot of the active set and the shutdown flag.
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock_state();
        let mut running_batches: Vec<String> = state.active.keys().cloned().collect();
        running_batches.sort();
        PoolStatus {
            active_batches: state.active.len(),
            running_batches,
            is_shutting_down: state.shutting_down,
        }
    }

    /// Stop accepting batches, ask every worker to stop, and wait for all
    /// handles to be reclaimed — force-terminating stragglers once the
    /// configured timeout elapses. Always completes; idempotent.
    pub async fn shutdown(&self) {
        let already = {
            let mut state = self.inner.lock_state();
            let already = state.shutting_down;
            state.shutting_down = true;
            for handle in state.active.values() {
                handle.cancel.cancel();
            }
            already
        };

        if already {
            debug!("shutdown already in progress, waiting for drain");
        } else {
            info!(
                active = self.status().active_batches,
                timeout_ms = self.inner.config.shutdown_timeout.as_millis() as u64,
                "pool shutting down"
            );
        }

        let start = Instant::now();
        while !self.is_drained() && start.elapsed() < self.inner.config.shutdown_timeout {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        if self.is_drained() {
            info!("pool shut down cleanly");
            return;
        }

        // Deadline elapsed: kill remaining worker tasks. Their supervisors
        // observe the abort and reconcile the jobs as failed.
        let stragglers: Vec<(String, AbortHandle)> = {
            let state = self.inner.lock_state();
            state
                .active
                .iter()
                .map(|(id, h)| (id.clone(), h.worker_abort.clone()))
                .collect()
        };
        warn!(count = stragglers.len(), "forcing worker termination");
        for (batch_id, abort) in &stragglers {
            debug!(batch_id = %batch_id, "aborting worker");
            abort.abort();
        }

        let start = Instant::now();
        while !self.is_drained() && start.elapsed() < FORCE_REAP_GRACE {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        if !self.is_drained() {
            // Supervisors are stuck (e.g. a hanging store write). Reconcile
            // inline so shutdown still completes with an empty active set.
            let unclaimed: Vec<String> = {
                let mut state = self.inner.lock_state();
                state
                    .active
                    .iter_mut()
                    .filter(|(_, h)| !h.reclaiming)
                    .map(|(id, h)| {
                        h.reclaiming = true;
                        id.clone()
                    })
                    .collect()
            };
            for batch_id in &unclaimed {
                self.inner
                    .reconcile_jobs(batch_id, None, "worker did not stop within shutdown timeout")
                    .await;
            }
            let mut state = self.inner.lock_state();
            error!(
                count = state.active.len(),
                "clearing unreclaimed handles at shutdown"
            );
            state.active.clear();
        }

        info!("pool shut down");
    }

    fn is_drained(&self) -> bool {
        self.inner.lock_state().active.is_empty()
    }
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Per-batch supervision: relay messages in arrival order, then
    /// reconcile the exit.
    async fn supervise(
        &self,
        batch_id: String,
        worker_task: tokio::task::JoinHandle<anyhow::Result<()>>,
        mut rx: mpsc::Receiver<WorkerMessage>,
    ) {
        let worker_id = format!("worker-{}", Uuid::new_v4());
        info!(batch_id = %batch_id, worker_id = %worker_id, "worker started");

        // The library scope, if any, widens event publication.
        let library = match self.store.find_batch(&batch_id).await {
            Ok(batch) => batch.and_then(|b| b.library),
            Err(e) => {
                error!(batch_id = %batch_id, error = %e, "failed to load batch");
                None
            }
        };

        let mut finished = false;
        while let Some(msg) = rx.recv().await {
            if matches!(msg, WorkerMessage::Finished) {
                finished = true;
            }
            self.relay(&batch_id, library.as_deref(), &msg).await;
        }

        // Channel closed: the worker returned, panicked, or was aborted.
        let exit = match worker_task.await {
            Ok(Ok(())) if finished => WorkerExit::Clean,
            Ok(Ok(())) => {
                WorkerExit::Crashed("worker exited without reporting completion".to_string())
            }
            Ok(Err(e)) => WorkerExit::Crashed(format!("worker error: {e}")),
            Err(e) if e.is_panic() => WorkerExit::Crashed("worker panicked".to_string()),
            Err(_) => WorkerExit::Crashed("worker was terminated".to_string()),
        };

        self.reconcile(&batch_id, library.as_deref(), exit).await;
    }

    /// Apply one worker message to the store and publish the matching
    /// event. Errors are logged and contained: a failed write must not
    /// prevent later messages or handle reclamation.
    async fn relay(&self, batch_id: &str, library: Option<&str>, msg: &WorkerMessage) {
        if self.is_reclaiming(batch_id) {
            debug!(batch_id = %batch_id, "dropping message for reclaimed batch");
            return;
        }

        let event = match msg {
            WorkerMessage::BatchStarted { total_jobs } => Some(BatchEvent::BatchStarted {
                batch_id: batch_id.to_string(),
                total_jobs: *total_jobs,
            }),
            WorkerMessage::JobStarted { job_id } => {
                self.write_status(*job_id, JobStatus::Processing, None).await;
                Some(BatchEvent::JobStarted {
                    batch_id: batch_id.to_string(),
                    job_id: *job_id,
                })
            }
            WorkerMessage::JobCompleted { job_id } => {
                self.write_status(*job_id, JobStatus::Completed, None).await;
                Some(BatchEvent::JobCompleted {
                    batch_id: batch_id.to_string(),
                    job_id: *job_id,
                })
            }
            WorkerMessage::JobFailed { job_id, error } => {
                self.write_status(*job_id, JobStatus::Failed, Some(error.as_str()))
                    .await;
                Some(BatchEvent::JobFailed {
                    batch_id: batch_id.to_string(),
                    job_id: *job_id,
                    error: error.clone(),
                })
            }
            // Clean completion is published at reconciliation
            WorkerMessage::Finished => None,
        };

        if matches!(
            msg,
            WorkerMessage::JobStarted { .. }
                | WorkerMessage::JobCompleted { .. }
                | WorkerMessage::JobFailed { .. }
        ) {
            if let Err(e) = self.store.recompute_summary(batch_id).await {
                error!(batch_id = %batch_id, error = %e, "failed to recompute batch summary");
            }
        }

        if let Some(event) = event {
            self.publish_event(library, &event).await;
        }
    }

    async fn write_status(&self, job_id: i64, status: JobStatus, error_message: Option<&str>) {
        let processed_at = status.is_terminal().then(chrono::Utc::now);
        if let Err(e) = self
            .store
            .write_job_status(job_id, status, processed_at, error_message)
            .await
        {
            error!(job_id = job_id, error = %e, "failed to write job status");
        }
    }

    /// Resolve a worker's exit into final job states and free its slot.
    ///
    /// The handle is claimed under the lock before any I/O, so the normal
    /// exit, crash, and forced-shutdown paths cannot both reconcile the
    /// same batch.
    async fn reconcile(&self, batch_id: &str, library: Option<&str>, exit: WorkerExit) {
        let started_at = {
            let mut state = self.lock_state();
            match state.active.get_mut(batch_id) {
                Some(handle) if !handle.reclaiming => {
                    handle.reclaiming = true;
                    handle.started_at
                }
                _ => {
                    debug!(batch_id = %batch_id, "batch already reclaimed");
                    return;
                }
            }
        };

        match exit {
            WorkerExit::Clean => {
                let summary = match self.store.recompute_summary(batch_id).await {
                    Ok(summary) => summary,
                    Err(e) => {
                        error!(batch_id = %batch_id, error = %e, "failed to read final summary");
                        Default::default()
                    }
                };
                self.publish_event(
                    library,
                    &BatchEvent::BatchCompleted {
                        batch_id: batch_id.to_string(),
                        summary,
                    },
                )
                .await;
                info!(
                    batch_id = %batch_id,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "batch completed"
                );
            }
            WorkerExit::Crashed(reason) => {
                warn!(batch_id = %batch_id, reason = %reason, "worker crashed");
                self.reconcile_jobs(batch_id, library, &reason).await;
            }
        }

        self.lock_state().active.remove(batch_id);
    }

    /// Crash path: fail every non-terminal job of the batch and announce
    /// the failure. Reclamation proceeds even if the writes fail — a
    /// phantom "active" batch would be worse than a stale status row.
    async fn reconcile_jobs(&self, batch_id: &str, library: Option<&str>, reason: &str) {
        match self
            .store
            .fail_incomplete_jobs(batch_id, WORKER_TERMINATED_REASON)
            .await
        {
            Ok(failed) if failed > 0 => {
                info!(batch_id = %batch_id, failed = failed, "failed incomplete jobs after worker crash");
            }
            Ok(_) => {}
            Err(e) => {
                error!(batch_id = %batch_id, error = %e, "failed to reconcile jobs after worker crash");
            }
        }

        if let Err(e) = self.store.recompute_summary(batch_id).await {
            error!(batch_id = %batch_id, error = %e, "failed to recompute batch summary");
        }

        self.publish_event(
            library,
            &BatchEvent::BatchFailed {
                batch_id: batch_id.to_string(),
                reason: reason.to_string(),
            },
        )
        .await;
    }

    async fn publish_event(&self, library: Option<&str>, event: &BatchEvent) {
        let value = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "failed to serialize event");
                return;
            }
        };
        self.hub.publish("batch", event.batch_id(), value.clone()).await;
        if let Some(library) = library {
            self.hub.publish("library", library, value).await;
        }
    }

    fn is_reclaiming(&self, batch_id: &str) -> bool {
        let state = self.lock_state();
        match state.active.get(batch_id) {
            Some(handle) => handle.reclaiming,
            None => true,
        }
    }
}
