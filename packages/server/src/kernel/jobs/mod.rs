//! Batch ingestion infrastructure.
//!
//! - [`JobService`] - admission control for batch submissions
//! - [`WorkerPool`] - supervised per-batch worker execution
//! - [`JobStore`] - durable job/batch state (Postgres in production)
//! - [`BatchWorker`] - the execution unit contract, with [`ScrapeWorker`]
//!   as the production implementation
//!
//! # Architecture
//!
//! ```text
//! submit_batch(batch_id)
//!     │
//!     └─► JobService (accepted / duplicate / capacity-exceeded)
//!             └─► WorkerPool.spawn_worker
//!                     ├─► BatchWorker task (one per batch)
//!                     ├─► relay: JobStore writes + StreamHub events
//!                     └─► reconcile on exit (clean or crashed)
//! ```

pub mod events;
mod job;
pub mod pool;
pub mod service;
mod store;
pub mod testing;
mod worker;

pub use events::BatchEvent;
pub use job::{Batch, BatchSummary, Job, JobStatus, ScrapeType};
pub use pool::{PoolConfig, PoolStatus, SpawnOutcome, WorkerPool};
pub use service::{JobService, SubmitOutcome};
pub use store::{JobStore, PostgresJobStore, StoreError, WORKER_TERMINATED_REASON};
pub use worker::{BatchWorker, DocumentSink, MarkdownDirSink, ScrapeWorker, WorkerMessage};
