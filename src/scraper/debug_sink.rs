use crate::scraper::http_client::RawResponse;
use chrono::Local;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Write-only dump of every API response, one file per (page, attempt).
/// Failures to write are logged and otherwise ignored.
#[derive(Debug, Clone, Default)]
pub struct DebugSink {
    dir: Option<PathBuf>,
}

impl DebugSink {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn record(&self, page: u32, attempt: u32, response: &RawResponse) -> Option<PathBuf> {
        let dir = self.dir.as_deref()?;
        match write_dump(dir, page, attempt, response) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Could not save response for page {} attempt {}: {}", page, attempt, e);
                None
            }
        }
    }
}

fn write_dump(
    dir: &Path,
    page: u32,
    attempt: u32,
    response: &RawResponse,
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!(
        "api_response_page{}_try{}_{}.txt",
        page,
        attempt,
        Local::now().format("%Y%m%d_%H%M%S%.3f")
    ));

    let mut f = std::fs::File::create(&path)?;
    writeln!(f, "Status Code: {}", response.status.as_u16())?;
    writeln!(f, "Headers: {:?}", response.headers)?;
    writeln!(f, "Response Text: {}", response.body)?;
    f.sync_all()?;
    Ok(path)
}
