// Main entry point for the ingestion server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ingest_core::kernel::jobs::{
    JobService, JobStore, MarkdownDirSink, PoolConfig, PostgresJobStore, ScrapeWorker, WorkerPool,
};
use ingest_core::kernel::{PageScraper, StreamHub};
use ingest_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ingest-server", about = "Process documentation ingestion batches")]
struct Args {
    /// Batch ids to submit for processing
    batch_ids: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ingest_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting documentation ingestion server");

    let args = Args::parse();

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let store = Arc::new(PostgresJobStore::new(pool));

    // A previous run may have died with jobs mid-flight; fail them so no
    // row is left stuck in processing with no owning worker.
    let recovered = store
        .recover_orphaned_jobs()
        .await
        .context("Failed to recover orphaned jobs")?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "recovered orphaned jobs from previous run");
    }

    if args.batch_ids.is_empty() {
        tracing::info!("No batch ids given, nothing to do");
        return Ok(());
    }

    let hub = StreamHub::new();
    let scraper = Arc::new(PageScraper::new(config.scrape_timeout)?);
    let sink = Arc::new(MarkdownDirSink::new(&config.output_dir));
    let worker = Arc::new(ScrapeWorker::new(store.clone(), scraper, sink));

    let worker_pool = WorkerPool::new(
        store.clone(),
        hub,
        worker,
        PoolConfig {
            max_concurrent_batches: config.max_concurrent_batches,
            shutdown_timeout: config.shutdown_timeout,
        },
    );
    let service = JobService::new(worker_pool.clone());

    for batch_id in &args.batch_ids {
        if !store.has_pending_jobs(batch_id).await? {
            tracing::warn!(batch_id = %batch_id, "batch has no pending jobs, skipping");
            continue;
        }
        let outcome = service.submit_batch(batch_id);
        tracing::info!("{}", outcome.message(batch_id));
    }

    // Run until every submitted batch drains or the operator interrupts
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                if service.pool_status().active_batches == 0 {
                    break;
                }
            }
        }
    }

    worker_pool.shutdown().await;
    tracing::info!("ingestion server stopped");

    Ok(())
}
