use crate::config::ScraperConfig;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Inter-request delay: `base + attempt * step + jitter`, jitter uniform in
/// `[jitter_min, jitter_max]`. Called before every request, retries or not.
#[derive(Debug, Clone)]
pub struct Pacer {
    base: Duration,
    step: Duration,
    jitter_min_ms: u64,
    jitter_max_ms: u64,
}

impl Pacer {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            base: Duration::from_millis(config.request_delay_ms),
            step: Duration::from_millis(config.retry_step_ms),
            jitter_min_ms: config.jitter_min_ms,
            jitter_max_ms: config.jitter_max_ms.max(config.jitter_min_ms),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = if self.jitter_max_ms > self.jitter_min_ms {
            rand::random_range(self.jitter_min_ms..=self.jitter_max_ms)
        } else {
            self.jitter_min_ms
        };
        self.base + self.step * attempt + Duration::from_millis(jitter_ms)
    }

    pub async fn wait(&self, attempt: u32) {
        let delay = self.delay(attempt);
        debug!("Waiting {:.1?} before request (attempt {})", delay, attempt);
        sleep(delay).await;
    }
}
