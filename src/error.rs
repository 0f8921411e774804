use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

use crate::scraper::http_client::RawResponse;

// ── Transport ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-2xx response. The body is kept so it still reaches the debug sink.
    #[error("HTTP {}", .0.status)]
    Status(Box<RawResponse>),

    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
}

impl TransportError {
    /// Whether the transport's own retry budget should be spent on this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Request(e) => e.is_timeout() || e.is_connect(),
            TransportError::Status(resp) => {
                resp.status == StatusCode::TOO_MANY_REQUESTS || resp.status.is_server_error()
            }
            TransportError::Header(_) => false,
        }
    }
}

// ── Fetch (one attempt at one page) ───────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("unparseable response: {0}")]
    Parse(String),

    #[error("server returned error code {0:?}")]
    ServerErrorCode(String),

    #[error("page contained no records")]
    EmptyPage,
}

impl FetchError {
    /// An explicit error code usually means the session was throttled or dropped.
    pub fn needs_rebootstrap(&self) -> bool {
        matches!(self, FetchError::ServerErrorCode(_))
    }

    /// Multiplier applied to the attempt number for the post-failure backoff.
    /// `None` means the next pre-request wait is the only delay.
    pub fn backoff_factor(&self) -> Option<u32> {
        match self {
            FetchError::Network(_) => Some(1),
            FetchError::ServerErrorCode(_) => Some(2),
            FetchError::Parse(_) | FetchError::EmptyPage => None,
        }
    }
}

// ── Harvest ───────────────────────────────────────────────────────────────────

/// Reasons a harvest stopped before walking the page range.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HarvestError {
    #[error("session bootstrap failed: {0}")]
    SessionBootstrap(String),

    #[error("first page yielded no records")]
    FirstPageUnavailable,
}

// ── Normalization ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("record has no product code")]
    MissingProductCode,
}

// ── Storage ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open DuckDB at {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: duckdb::Error,
    },

    /// The whole batch was rolled back.
    #[error("{table} batch rolled back")]
    Batch {
        table: &'static str,
        #[source]
        source: duckdb::Error,
    },

    #[error(transparent)]
    Query(#[from] duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
