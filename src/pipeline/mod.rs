//! Pipeline orchestrator: ties scraper → storage together.
//!
//! One run:
//!   1. Open the DuckDB file and apply migrations
//!   2. Harvest every page of the product listing (sequential, paced)
//!   3. Upsert products, then NAV observations (each its own transaction)
//!   4. Record the run in `harvest_runs` and close the connection
//!
//! Idempotent: re-running on the same day inserts nothing new; a NAV whose
//! value moved since the last run is overwritten and flagged `is_updated`.

use crate::config::{AppConfig, StorageConfig};
use crate::scraper::{ChinaWealthScraper, ProductSource};
use crate::storage::Repository;
use anyhow::{Context, Result};
use tracing::{error, info, warn};

pub struct Pipeline {
    config: AppConfig,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, max_pages: Option<u32>) -> Result<PipelineStats> {
        let scraper = ChinaWealthScraper::new(&self.config.scraper, &self.config.pipeline)
            .context("Failed to build scraper")?;
        self.run_with(&scraper, max_pages).await
    }

    pub async fn run_with(
        &self,
        source: &dyn ProductSource,
        max_pages: Option<u32>,
    ) -> Result<PipelineStats> {
        let repo = open_repository(&self.config.storage)?;

        let result = self.harvest_into(&repo, source, max_pages).await;

        // Release the connection whichever way the run went
        if let Err(e) = repo.close() {
            warn!("Closing DuckDB failed: {}", e);
        }
        result
    }

    async fn harvest_into(
        &self,
        repo: &Repository,
        source: &dyn ProductSource,
        max_pages: Option<u32>,
    ) -> Result<PipelineStats> {
        let run_id = match repo.begin_harvest_run() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Could not open a harvest run record, continuing without one: {}", e);
                None
            }
        };

        info!("=== Step 1: Harvesting product listing ===");
        let harvest = source.scrape(max_pages).await;
        if let Some(reason) = &harvest.aborted {
            warn!("Harvest stopped early: {}", reason);
        }

        info!(
            "=== Step 2: Saving {} products / {} NAV observations ===",
            harvest.products.len(),
            harvest.navs.len()
        );
        let saved = repo
            .upsert_products(&harvest.products)
            .context("Product batch failed")
            .and_then(|products| {
                let navs = repo
                    .upsert_navs(&harvest.navs)
                    .context("NAV batch failed")?;
                Ok((products, navs))
            });

        let (products_saved, navs_saved) = match saved {
            Ok(counts) => counts,
            Err(e) => {
                error!("{:#}", e);
                let failed = PipelineStats {
                    pages_attempted: harvest.stats.pages_attempted,
                    pages_failed: harvest.stats.pages_failed,
                    records_normalized: harvest.products.len(),
                    records_skipped: harvest.stats.records_skipped,
                    products_saved: 0,
                    navs_saved: 0,
                };
                record_run(repo, run_id, &failed, Some(&format!("{:#}", e)));
                return Err(e);
            }
        };

        let stats = PipelineStats {
            pages_attempted: harvest.stats.pages_attempted,
            pages_failed: harvest.stats.pages_failed,
            records_normalized: harvest.products.len(),
            records_skipped: harvest.stats.records_skipped,
            products_saved,
            navs_saved,
        };

        let problem = match (&harvest.aborted, stats.pages_failed) {
            (Some(reason), _) => Some(reason.to_string()),
            (None, 0) => None,
            (None, n) => Some(format!("{} pages failed", n)),
        };
        record_run(repo, run_id, &stats, problem.as_deref());

        info!(
            "=== Done: {} pages ({} failed) | {} records | {} products | {} NAV rows | DB holds {} products, {} NAVs ===",
            stats.pages_attempted,
            stats.pages_failed,
            stats.records_normalized,
            stats.products_saved,
            stats.navs_saved,
            repo.product_count().unwrap_or(0),
            repo.nav_count().unwrap_or(0),
        );

        Ok(stats)
    }
}

/// Open the configured database, applying migrations unless disabled, so
/// every command sees the full schema even on a fresh file.
pub fn open_repository(storage: &StorageConfig) -> Result<Repository> {
    let repo = Repository::open(&storage.db_path).context("Failed to open DuckDB")?;
    if storage.run_migrations {
        if let Err(e) = repo.run_migrations() {
            repo.close().ok();
            return Err(e).context("Migrations failed");
        }
    }
    Ok(repo)
}

/// Close the run record, if one was opened. Failures here never fail the run.
fn record_run(repo: &Repository, run_id: Option<i64>, stats: &PipelineStats, problem: Option<&str>) {
    let Some(id) = run_id else {
        warn!("Harvest run not recorded: no run record was opened");
        return;
    };
    if let Err(e) = repo.finish_harvest_run(
        id,
        stats.pages_attempted,
        stats.pages_failed,
        stats.products_saved,
        stats.navs_saved,
        problem,
    ) {
        warn!("Could not finish harvest run #{}: {}", id, e);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStats {
    pub pages_attempted: u32,
    pub pages_failed: u32,
    pub records_normalized: usize,
    pub records_skipped: usize,
    pub products_saved: usize,
    pub navs_saved: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarvestError;
    use crate::models::{NavRecord, NavValues, Product};
    use crate::scraper::testing::{mount_landing, mount_page, record, test_config};
    use crate::scraper::{Harvest, HarvestStats};
    use async_trait::async_trait;
    use chrono::Local;
    use wiremock::MockServer;

    struct FixedSource(fn() -> Harvest);

    #[async_trait]
    impl ProductSource for FixedSource {
        async fn scrape(&self, _max_pages: Option<u32>) -> Harvest {
            (self.0)()
        }
    }

    fn config_in(dir: &tempfile::TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.db_path = dir.path().join("test.duckdb");
        config
    }

    fn one_product() -> Harvest {
        let now = Local::now().naive_local();
        Harvest {
            products: vec![Product {
                product_code: "X".into(),
                product_name: Some("Fund X".into()),
                crawl_time: now,
                ..Default::default()
            }],
            navs: vec![NavRecord {
                product_code: "X".into(),
                product_id: None,
                nav_date: now.date().format("%Y-%m-%d").to_string(),
                values: NavValues {
                    current_nav: Some(1.05),
                    ..Default::default()
                },
                crawl_time: now,
            }],
            stats: HarvestStats {
                pages_attempted: 1,
                ..Default::default()
            },
            aborted: None,
        }
    }

    fn bootstrap_failed() -> Harvest {
        Harvest {
            aborted: Some(HarvestError::SessionBootstrap("refused".into())),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(config_in(&dir));

        let first = pipeline.run_with(&FixedSource(one_product), None).await.unwrap();
        let second = pipeline.run_with(&FixedSource(one_product), None).await.unwrap();
        assert_eq!(first, second);

        let repo = Repository::open(&dir.path().join("test.duckdb")).unwrap();
        assert_eq!(repo.product_count().unwrap(), 1);
        assert_eq!(repo.nav_count().unwrap(), 1);
        let nav = repo.latest_nav("X").unwrap().unwrap();
        assert!(!nav.is_updated);
        assert_eq!(repo.last_harvest_run().unwrap().unwrap().status, "success");
        repo.close().unwrap();
    }

    #[tokio::test]
    async fn test_aborted_harvest_records_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(config_in(&dir));

        let stats = pipeline
            .run_with(&FixedSource(bootstrap_failed), None)
            .await
            .unwrap();
        assert_eq!(stats.products_saved, 0);

        let repo = Repository::open(&dir.path().join("test.duckdb")).unwrap();
        let run = repo.last_harvest_run().unwrap().unwrap();
        assert_eq!(run.status, "error");
        assert!(run.error_msg.unwrap().contains("session bootstrap"));
        repo.close().unwrap();
    }

    #[test]
    fn test_fresh_database_reports_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        let repo = open_repository(&config.storage).unwrap();
        assert_eq!(repo.product_count().unwrap(), 0);
        assert_eq!(repo.nav_count().unwrap(), 0);
        assert!(repo.last_harvest_run().unwrap().is_none());
        assert!(repo.latest_nav("X").unwrap().is_none());
        assert!(repo.export_combined().unwrap().is_empty());
        repo.close().unwrap();
    }

    #[tokio::test]
    async fn test_missing_run_log_does_not_block_harvest() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.storage.run_migrations = false;

        let repo = Repository::open(&config.storage.db_path).unwrap();
        repo.run_migrations().unwrap();
        repo.close().unwrap();
        duckdb::Connection::open(&config.storage.db_path)
            .unwrap()
            .execute_batch("DROP TABLE harvest_runs; DROP SEQUENCE harvest_runs_seq;")
            .unwrap();

        let stats = Pipeline::new(config)
            .run_with(&FixedSource(one_product), None)
            .await
            .unwrap();
        assert_eq!(stats.products_saved, 1);
        assert_eq!(stats.navs_saved, 1);

        let repo = Repository::open(&dir.path().join("test.duckdb")).unwrap();
        assert_eq!(repo.product_count().unwrap(), 1);
        repo.close().unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_against_mock_site() {
        let server = MockServer::start().await;
        mount_landing(&server).await;
        mount_page(
            &server,
            1,
            vec![record("A", "1.05"), record("B", "--")],
            2,
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.scraper = test_config(&server);
        let pipeline = Pipeline::new(config);

        let stats = pipeline.run(None).await.unwrap();
        assert_eq!(stats.pages_attempted, 1);
        assert_eq!(stats.products_saved, 2);
        // B still has an initial NAV of 1.0
        assert_eq!(stats.navs_saved, 2);

        let repo = Repository::open(&dir.path().join("test.duckdb")).unwrap();
        let a = repo.product_by_code("A").unwrap().unwrap();
        assert_eq!(a.product_name.as_deref(), Some("Product A"));
        let b_nav = repo.latest_nav("B").unwrap().unwrap();
        assert_eq!(b_nav.initial_nav, Some(1.0));
        assert_eq!(b_nav.current_nav, None);
        repo.close().unwrap();
    }
}
