use std::time::Instant;
use tracing::info;

/// Logs when a CLI command starts and how long it ran once dropped.
pub struct Timer {
    command: &'static str,
    started: Instant,
}

impl Timer {
    pub fn start(command: &'static str) -> Self {
        info!(command, "started");
        Self {
            command,
            started: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        info!(command = self.command, "finished in {:.2?}", elapsed);
    }
}

/// Row counts with thousands separators, e.g. `12,480`.
pub fn fmt_count(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// NAVs are quoted to four decimals, as the site shows them.
pub fn fmt_nav(v: Option<f64>) -> String {
    v.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".into())
}
