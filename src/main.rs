mod config;
mod error;
mod export;
mod models;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::Result;
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;
use crate::pipeline::{Pipeline, open_repository};

#[derive(Parser)]
#[command(name = "chinawealth-etl", about = "Wealth-management product & NAV harvester", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Harvest the product listing and upsert products + NAVs
    Harvest {
        /// Stop after this many pages (default: config, 0 = all)
        #[arg(long)]
        max_pages: Option<u32>,

        /// Route requests through the configured proxy
        #[arg(long)]
        use_proxy: bool,

        /// Proxy URL (implies --use-proxy)
        #[arg(long, env = "CHINAWEALTH_PROXY_URL")]
        proxy_url: Option<String>,
    },

    /// Export products, NAVs and the combined view to CSV
    Export {
        /// Output directory (default: config export.output_dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Show database statistics
    Stats,

    /// Show one product and its latest NAV
    Show {
        /// Product registration code
        product_code: String,

        /// NAV date (YYYY-MM-DD) instead of the latest one
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Apply schema migrations without harvesting
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "chinawealth_etl=info,warn",
        1 => "chinawealth_etl=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let mut config = AppConfig::load()?;

    match cli.command {
        Command::Harvest {
            max_pages,
            use_proxy,
            proxy_url,
        } => {
            let _t = utils::Timer::start("harvest");
            if proxy_url.is_some() {
                config.scraper.proxy_url = proxy_url;
                config.scraper.use_proxy = true;
            } else if use_proxy {
                config.scraper.use_proxy = true;
            }
            if let Some(n) = max_pages {
                config.pipeline.max_pages = n;
            }
            config.validate()?;

            let max_pages = config.pipeline.max_pages();
            let stats = Pipeline::new(config).run(max_pages).await?;
            info!(
                "Done: {} pages ({} failed), {} records ({} skipped), {} products, {} NAV rows",
                stats.pages_attempted,
                stats.pages_failed,
                stats.records_normalized,
                stats.records_skipped,
                stats.products_saved,
                stats.navs_saved
            );
        }

        Command::Export { dir } => {
            let _t = utils::Timer::start("export");
            let dir = dir.unwrap_or_else(|| config.export.output_dir.clone());
            let repo = open_repository(&config.storage)?;
            let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
            let result = export::export_csv(&repo, &dir, &stamp);
            repo.close()?;
            let files = result?;
            println!("Products : {}", files.products.display());
            println!("NAVs     : {}", files.navs.display());
            println!("Combined : {}", files.combined.display());
        }

        Command::Stats => {
            let _t = utils::Timer::start("stats");
            let repo = open_repository(&config.storage)?;
            let products = repo.product_count()?;
            let navs = repo.nav_count()?;
            let last_run = repo.last_harvest_run()?;
            repo.close()?;

            println!("─────────────────────────────────");
            println!("  Wealth ETL · Database Stats");
            println!("─────────────────────────────────");
            println!("  Products  : {}", utils::fmt_count(products));
            println!("  NAV rows  : {}", utils::fmt_count(navs));
            match last_run {
                Some(run) => {
                    println!("  Last run  : #{} {} ({})", run.id, run.started_at, run.status);
                    if let Some(finished) = run.finished_at {
                        println!("  Finished  : {}", finished);
                    }
                    println!(
                        "  Pages     : {} ({} failed)",
                        run.pages_attempted, run.pages_failed
                    );
                    println!(
                        "  Saved     : {} products, {} NAVs",
                        run.products_saved, run.navs_saved
                    );
                    if let Some(msg) = run.error_msg {
                        println!("  Error     : {}", msg);
                    }
                }
                None => println!("  Last run  : none"),
            }
            println!("─────────────────────────────────");
        }

        Command::Show { product_code, date } => {
            let _t = utils::Timer::start("show");
            let repo = open_repository(&config.storage)?;
            let product = repo.product_by_code(&product_code)?;
            let nav = match date {
                Some(d) => repo.nav_on(&product_code, d)?,
                None => repo.latest_nav(&product_code)?,
            };
            repo.close()?;

            let Some(p) = product else {
                println!("No product with code {}", product_code);
                return Ok(());
            };
            println!("{} {}", p.product_code, p.product_name.as_deref().unwrap_or("-"));
            println!("  Issuer   : {}", p.issuer.as_deref().unwrap_or("-"));
            println!("  Risk     : {}", p.risk_level.as_deref().unwrap_or("-"));
            println!("  Currency : {}", p.currency.as_deref().unwrap_or("-"));
            println!("  Crawled  : {}", p.crawl_time);
            match nav {
                Some(n) => {
                    println!(
                        "  NAV {}  : initial {} | accumulated {} | current {}",
                        n.nav_date,
                        utils::fmt_nav(n.initial_nav),
                        utils::fmt_nav(n.accumulated_nav),
                        utils::fmt_nav(n.current_nav),
                    );
                    if let (true, Some(on)) = (n.is_updated, n.last_update_date) {
                        println!("  Revised  : {}", on);
                    }
                }
                None => println!("  NAV      : none recorded"),
            }
        }

        Command::Migrate => {
            let _t = utils::Timer::start("migrate");
            config.storage.run_migrations = true;
            let repo = open_repository(&config.storage)?;
            repo.close()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}
