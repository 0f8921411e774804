use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

/// Scraper configuration: endpoints, pacing, retry budgets and client identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    /// Landing page fetched to obtain session cookies.
    #[serde(default = "default_landing_url")]
    pub landing_url: String,

    /// Paginated product search endpoint.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Pacer base delay before every request.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    /// Pacer increment per retry attempt.
    #[serde(default = "default_retry_step_ms")]
    pub retry_step_ms: u64,

    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,

    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,

    /// Attempts per page before it is skipped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Transport-level retries for 429/5xx, timeouts and refused connections.
    #[serde(default = "default_transport_retries")]
    pub transport_retries: usize,

    #[serde(default = "default_transport_backoff_ms")]
    pub transport_backoff_ms: u64,

    #[serde(default)]
    pub use_proxy: bool,

    #[serde(default)]
    pub proxy_url: Option<String>,

    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,

    /// Where raw API responses are dumped. `None` disables the sink.
    #[serde(default = "default_debug_dir")]
    pub debug_dir: Option<PathBuf>,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// 0 means no limit.
    #[serde(default)]
    pub max_pages: u32,

    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_dir")]
    pub output_dir: PathBuf,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_landing_url() -> String {
    "https://www.chinawealth.com.cn/zzlc/jsp/lccp.jsp".to_string()
}
fn default_api_url() -> String {
    "https://www.chinawealth.com.cn/LcSolrSearch.go".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_request_delay_ms() -> u64 {
    5000
}
fn default_retry_step_ms() -> u64 {
    2000
}
fn default_jitter_min_ms() -> u64 {
    1000
}
fn default_jitter_max_ms() -> u64 {
    3000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_transport_retries() -> usize {
    5
}
fn default_transport_backoff_ms() -> u64 {
    2000
}
fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.3.1 Safari/605.1.15",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Edge/122.0.0.0",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_debug_dir() -> Option<PathBuf> {
    Some(PathBuf::from("data/debug"))
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/db/financial_products.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_page_size() -> u32 {
    100
}
fn default_export_dir() -> PathBuf {
    PathBuf::from("data/export")
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            landing_url: default_landing_url(),
            api_url: default_api_url(),
            timeout_secs: default_timeout_secs(),
            request_delay_ms: default_request_delay_ms(),
            retry_step_ms: default_retry_step_ms(),
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            max_attempts: default_max_attempts(),
            transport_retries: default_transport_retries(),
            transport_backoff_ms: default_transport_backoff_ms(),
            use_proxy: false,
            proxy_url: None,
            user_agents: default_user_agents(),
            debug_dir: default_debug_dir(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pages: 0,
            page_size: default_page_size(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_export_dir(),
        }
    }
}

impl PipelineConfig {
    pub fn max_pages(&self) -> Option<u32> {
        (self.max_pages > 0).then_some(self.max_pages)
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("CHINAWEALTH").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg
            .try_deserialize()
            .context("Invalid configuration")?;
        app_cfg.validate()?;
        Ok(app_cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.scraper;
        ensure!(s.max_attempts > 0, "scraper.max_attempts must be at least 1");
        ensure!(
            s.jitter_min_ms <= s.jitter_max_ms,
            "scraper.jitter_min_ms ({}) exceeds jitter_max_ms ({})",
            s.jitter_min_ms,
            s.jitter_max_ms
        );
        ensure!(!s.user_agents.is_empty(), "scraper.user_agents must not be empty");
        ensure!(
            !s.use_proxy || s.proxy_url.is_some(),
            "scraper.use_proxy is set but scraper.proxy_url is missing"
        );
        ensure!(self.pipeline.page_size > 0, "pipeline.page_size must be positive");
        Ok(())
    }
}
