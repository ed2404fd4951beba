//! Kernel: infrastructure shared by the ingestion pipeline.

pub mod jobs;
pub mod scraper;
pub mod stream_hub;

pub use scraper::PageScraper;
pub use stream_hub::StreamHub;
