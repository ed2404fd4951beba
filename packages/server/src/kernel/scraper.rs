//! HTTP page scraper: fetch, strip chrome, convert to Markdown.
//!
//! - reqwest for HTTP requests
//! - scraper crate for HTML parsing
//! - htmd for HTML to Markdown conversion
//!
//! No JavaScript rendering; static HTML only.

use std::time::Duration;

use anyhow::{Context, Result};
use scraper::{Html, Selector};

/// A scraped page, reduced to searchable content.
#[derive(Debug, Clone)]
pub struct ScrapedPage {
    pub title: Option<String>,
    pub markdown: String,
}

/// Stateless HTTP scraper shared across workers.
pub struct PageScraper {
    client: reqwest::Client,
}

impl PageScraper {
    pub fn new(timeout: Duration) -> Result<Self> {
        // Browser-like User-Agent to avoid bot detection on docs sites
        let user_agent = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Fetch a page and convert its main content to Markdown.
    pub async fn scrape_page(&self, url: &str) -> Result<ScrapedPage> {
        let html = self.fetch(url).await?;
        Ok(Self::page_from_html(&html))
    }

    /// Fetch a resource verbatim (API specs and other non-HTML sources).
    pub async fn fetch_raw(&self, url: &str) -> Result<String> {
        self.fetch(url).await
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {status} for {url}");
        }

        response.text().await.context("failed to read response body")
    }

    fn page_from_html(html: &str) -> ScrapedPage {
        let document = Html::parse_document(html);
        let title = Self::extract_title(&document);
        let content = Self::extract_main_content(&document);
        let markdown = htmd::convert(&content).unwrap_or(content);

        ScrapedPage { title, markdown }
    }

    fn extract_title(document: &Html) -> Option<String> {
        let selector = Selector::parse("title").ok()?;
        document
            .select(&selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    }

    /// Prefer a main-content region, falling back to the whole body.
    fn extract_main_content(document: &Html) -> String {
        let main_selectors = ["main", "article", "[role='main']", "#content", ".content"];

        for selector_str in main_selectors {
            if let Ok(selector) = Selector::parse(selector_str) {
                if let Some(main) = document.select(&selector).next() {
                    return main.html();
                }
            }
        }

        document.html()
    }
}
