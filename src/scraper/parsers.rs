use crate::error::FetchError;
use crate::models::ApiEnvelope;
use reqwest::StatusCode;
use serde_json::Value;

/// A page that parsed and carried records.
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<Value>,
    pub total_count: u64,
}

/// Classify one response from the search endpoint.
pub fn parse_search_response(status: StatusCode, body: &str) -> Result<Page, FetchError> {
    if !status.is_success() {
        return Err(FetchError::Network(format!("HTTP {}", status)));
    }

    let envelope: ApiEnvelope = serde_json::from_str(body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        FetchError::Parse(format!("{} (body: {:?})", e, preview))
    })?;

    if let Some(code) = envelope.code.as_deref() {
        if code.trim().eq_ignore_ascii_case("error") {
            return Err(FetchError::ServerErrorCode(code.to_string()));
        }
    }

    let records = envelope.list.unwrap_or_default();
    if records.is_empty() {
        return Err(FetchError::EmptyPage);
    }

    Ok(Page {
        records,
        total_count: envelope.count.unwrap_or(0),
    })
}

/// `ceil(total / page_size)`
pub fn total_pages(total_count: u64, page_size: u32) -> u32 {
    let page_size = u64::from(page_size.max(1));
    total_count.div_ceil(page_size).min(u64::from(u32::MAX)) as u32
}
