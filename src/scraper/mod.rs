pub mod cleaner;
pub mod debug_sink;
pub mod fetcher;
pub mod http_client;
pub mod pacer;
pub mod parsers;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::{PipelineConfig, ScraperConfig};
use crate::error::{HarvestError, TransportError};
use crate::models::{NavRecord, Product};
use async_trait::async_trait;
use chrono::Local;
use serde_json::Value;
use tracing::{error, info, warn};

use self::cleaner::normalize;
use self::fetcher::{PageFetcher, PageOutcome};
use self::parsers::total_pages;

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable product listing source; one implementation per target site.
#[async_trait]
pub trait ProductSource: Send + Sync {
    async fn scrape(&self, max_pages: Option<u32>) -> Harvest;
}

/// Everything one harvest accumulated, plus why it stopped early (if it did).
#[derive(Debug, Default)]
pub struct Harvest {
    pub products: Vec<Product>,
    pub navs: Vec<NavRecord>,
    pub stats: HarvestStats,
    pub aborted: Option<HarvestError>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct HarvestStats {
    pub total_count: u64,
    pub total_pages: u32,
    pub pages_attempted: u32,
    pub pages_failed: u32,
    pub records_seen: usize,
    pub records_skipped: usize,
}

impl Harvest {
    fn aborted(reason: HarvestError, stats: HarvestStats) -> Self {
        Self {
            stats,
            aborted: Some(reason),
            ..Default::default()
        }
    }

    /// Normalize a page worth of records; a bad record only skips itself.
    fn absorb_page(&mut self, page: u32, records: &[Value]) {
        let now = Local::now().naive_local();
        for record in records {
            self.stats.records_seen += 1;
            match normalize(record, now) {
                Ok((product, nav)) => {
                    self.products.push(product);
                    self.navs.extend(nav);
                }
                Err(e) => {
                    warn!("Page {}: skipping record: {}", page, e);
                    self.stats.records_skipped += 1;
                }
            }
        }
    }
}

// ── chinawealth scraper ───────────────────────────────────────────────────────

pub struct ChinaWealthScraper {
    fetcher: PageFetcher,
    page_size: u32,
}

impl ChinaWealthScraper {
    pub fn new(scraper: &ScraperConfig, pipeline: &PipelineConfig) -> Result<Self, TransportError> {
        Ok(Self {
            fetcher: PageFetcher::new(scraper)?,
            page_size: pipeline.page_size,
        })
    }
}

#[async_trait]
impl ProductSource for ChinaWealthScraper {
    async fn scrape(&self, max_pages: Option<u32>) -> Harvest {
        let mut stats = HarvestStats::default();

        if let Err(e) = self.fetcher.bootstrap().await {
            error!("{}, aborting harvest", e);
            return Harvest::aborted(e, stats);
        }

        // ── 1. First page: total count ─────────────────────────────────────────
        stats.pages_attempted += 1;
        let first = match self.fetcher.fetch_page(1).await {
            PageOutcome::Success { page, .. } => page,
            PageOutcome::Failed { attempts, last_error } => {
                warn!("Page 1 failed after {} attempts: {}", attempts, last_error);
                stats.pages_failed += 1;
                return Harvest::aborted(HarvestError::FirstPageUnavailable, stats);
            }
        };

        stats.total_count = first.total_count;
        stats.total_pages = total_pages(first.total_count, self.page_size);
        let last_page = match max_pages {
            Some(cap) => stats.total_pages.min(cap),
            None => stats.total_pages,
        };
        info!(
            "{} products across {} pages (fetching {})",
            stats.total_count, stats.total_pages, last_page
        );

        let mut harvest = Harvest {
            stats,
            ..Default::default()
        };
        harvest.absorb_page(1, &first.records);

        // ── 2. Remaining pages ─────────────────────────────────────────────────
        for page in 2..=last_page {
            info!("Fetching page {}/{}", page, last_page);
            harvest.stats.pages_attempted += 1;

            match self.fetcher.fetch_page(page).await {
                PageOutcome::Success {
                    page: result,
                    attempts,
                } => {
                    if attempts > 1 {
                        info!("Page {} recovered after {} attempts", page, attempts);
                    }
                    harvest.absorb_page(page, &result.records);
                }
                PageOutcome::Failed { attempts, last_error } => {
                    error!(
                        "Page {} skipped after {} attempts: {}",
                        page, attempts, last_error
                    );
                    harvest.stats.pages_failed += 1;
                }
            }
        }

        info!(
            "Harvest done: {} records seen, {} products, {} NAV observations, {} pages failed, {} records skipped",
            harvest.stats.records_seen,
            harvest.products.len(),
            harvest.navs.len(),
            harvest.stats.pages_failed,
            harvest.stats.records_skipped,
        );
        harvest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::testing::{
        api_path, mount_landing, mount_page, page_body, page_is, record, requests_for_page,
        test_config,
    };
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn scraper(server: &MockServer) -> ChinaWealthScraper {
        ChinaWealthScraper::new(&test_config(server), &PipelineConfig::default()).unwrap()
    }

    fn records(prefix: &str, n: usize) -> Vec<Value> {
        (0..n).map(|i| record(&format!("{prefix}{i:03}"), "1.05")).collect()
    }

    #[tokio::test]
    async fn test_walks_exactly_ceil_total_pages() {
        let server = MockServer::start().await;
        mount_landing(&server).await;
        mount_page(&server, 1, records("P1-", 100), 250).await;
        // Page 2 is empty once, then populated: retried, not end-of-data
        Mock::given(method("POST"))
            .and(path(api_path()))
            .and(page_is(2))
            .respond_with(ResponseTemplate::new(200).set_body_string(page_body(vec![], 250)))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(api_path()))
            .and(page_is(2))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(page_body(records("P2-", 100), 250)),
            )
            .with_priority(2)
            .mount(&server)
            .await;
        mount_page(&server, 3, records("P3-", 50), 250).await;
        mount_page(&server, 4, records("P4-", 10), 250).await;

        let harvest = scraper(&server).scrape(None).await;

        assert!(harvest.aborted.is_none());
        assert_eq!(harvest.stats.total_pages, 3);
        assert_eq!(harvest.stats.pages_attempted, 3);
        assert_eq!(harvest.products.len(), 250);
        assert_eq!(harvest.navs.len(), 250);
        assert_eq!(requests_for_page(&server, 1).await, 1);
        assert_eq!(requests_for_page(&server, 2).await, 2);
        assert_eq!(requests_for_page(&server, 3).await, 1);
        assert_eq!(requests_for_page(&server, 4).await, 0);
    }

    #[tokio::test]
    async fn test_failed_page_is_skipped_not_fatal() {
        let server = MockServer::start().await;
        mount_landing(&server).await;
        mount_page(&server, 1, records("P1-", 100), 250).await;
        mount_page(&server, 2, vec![], 250).await; // always empty
        mount_page(&server, 3, records("P3-", 50), 250).await;

        let harvest = scraper(&server).scrape(None).await;

        assert!(harvest.aborted.is_none());
        assert_eq!(harvest.stats.pages_failed, 1);
        assert_eq!(harvest.products.len(), 150);
        assert!(harvest.products.iter().any(|p| p.product_code == "P3-049"));
        assert!(!harvest.products.iter().any(|p| p.product_code.starts_with("P2-")));
        assert_eq!(requests_for_page(&server, 2).await, 3);
        assert_eq!(requests_for_page(&server, 3).await, 1);
    }

    #[tokio::test]
    async fn test_max_pages_caps_the_walk() {
        let server = MockServer::start().await;
        mount_landing(&server).await;
        mount_page(&server, 1, records("P1-", 100), 1000).await;
        mount_page(&server, 2, records("P2-", 100), 1000).await;

        let harvest = scraper(&server).scrape(Some(2)).await;

        assert_eq!(harvest.stats.total_pages, 10);
        assert_eq!(harvest.stats.pages_attempted, 2);
        assert_eq!(harvest.products.len(), 200);
        assert_eq!(requests_for_page(&server, 3).await, 0);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_aborts_with_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        mount_page(&server, 1, records("P1-", 5), 5).await;

        let harvest = scraper(&server).scrape(None).await;

        assert!(matches!(harvest.aborted, Some(HarvestError::SessionBootstrap(_))));
        assert!(harvest.products.is_empty());
        assert_eq!(requests_for_page(&server, 1).await, 0);
    }

    #[tokio::test]
    async fn test_empty_first_page_aborts() {
        let server = MockServer::start().await;
        mount_landing(&server).await;
        mount_page(&server, 1, vec![], 0).await;

        let harvest = scraper(&server).scrape(None).await;

        assert_eq!(harvest.aborted, Some(HarvestError::FirstPageUnavailable));
        assert!(harvest.products.is_empty());
        assert!(harvest.navs.is_empty());
    }

    #[tokio::test]
    async fn test_bad_record_skips_only_itself() {
        let server = MockServer::start().await;
        mount_landing(&server).await;
        let mut page = records("P1-", 3);
        page.push(json!({"cpms": "no code here"}));
        page.push(json!({"cpdjbm": "NONAV", "csjz": "--", "ljjz": "null", "cpjz": "0"}));
        mount_page(&server, 1, page, 5).await;

        let harvest = scraper(&server).scrape(None).await;

        assert_eq!(harvest.stats.records_seen, 5);
        assert_eq!(harvest.stats.records_skipped, 1);
        assert_eq!(harvest.products.len(), 4);
        assert_eq!(harvest.navs.len(), 3);
    }
}
