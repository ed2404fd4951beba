use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_concurrent_batches: usize,
    pub shutdown_timeout: Duration,
    pub scrape_timeout: Duration,
    pub output_dir: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_concurrent_batches: env::var("MAX_CONCURRENT_BATCHES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("MAX_CONCURRENT_BATCHES must be a valid number")?,
            shutdown_timeout: Duration::from_secs(
                env::var("SHUTDOWN_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "15".to_string())
                    .parse()
                    .context("SHUTDOWN_TIMEOUT_SECS must be a valid number")?,
            ),
            scrape_timeout: Duration::from_secs(
                env::var("SCRAPE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("SCRAPE_TIMEOUT_SECS must be a valid number")?,
            ),
            output_dir: env::var("OUTPUT_DIR").unwrap_or_else(|_| "./ingested".to_string()),
        })
    }
}
