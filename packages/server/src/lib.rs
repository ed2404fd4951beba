// Documentation Ingestion Server
//
// Ingests documentation sources (web pages, API specs, repository trees)
// as batches of jobs, each batch running in its own supervised worker
// under a global concurrency ceiling, with progress streamed to observers.

pub mod config;
pub mod kernel;

pub use config::Config;
