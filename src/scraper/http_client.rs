//! Transport session: cookie-carrying client, browser-like identity rotation
//! and optional proxy routing. Page-level retries live in the fetcher; the
//! only retrying done here is the transport budget for 429/5xx and dropped
//! connections.

use crate::config::ScraperConfig;
use crate::error::TransportError;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, ORIGIN, REFERER,
    USER_AGENT,
};
use reqwest::{Method, StatusCode};
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";

/// A response read to completion.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

/// Fixed pool of browser identities, one picked per request.
#[derive(Debug, Clone)]
pub struct UserAgentPool {
    agents: Vec<String>,
}

impl UserAgentPool {
    pub fn new(agents: Vec<String>) -> Self {
        Self { agents }
    }

    pub fn pick(&self) -> &str {
        match self.agents.len() {
            0 => "Mozilla/5.0",
            1 => &self.agents[0],
            n => &self.agents[rand::random_range(0..n)],
        }
    }
}

pub struct HttpSession {
    inner: reqwest::Client,
    identities: UserAgentPool,
    default_timeout: Duration,
    transport_retries: usize,
    transport_backoff_ms: u64,
}

impl HttpSession {
    pub fn new(config: &ScraperConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Accept cookies so the search endpoint sees the landing-page session
            .cookie_store(true);

        if config.use_proxy {
            if let Some(proxy_url) = &config.proxy_url {
                builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
            }
        }

        Ok(Self {
            inner: builder.build()?,
            identities: UserAgentPool::new(config.user_agents.clone()),
            default_timeout: Duration::from_secs(config.timeout_secs),
            transport_retries: config.transport_retries,
            transport_backoff_ms: config.transport_backoff_ms,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn get(
        &self,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        self.send(Method::GET, url, headers, None, timeout).await
    }

    /// POST a pre-encoded form body.
    pub async fn post(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: String,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        self.send(Method::POST, url, headers, Some(body), timeout).await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<String>,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.transport_backoff_ms / 2)
            .max_delay(Duration::from_secs(60))
            .map(jitter)
            .take(self.transport_retries);

        RetryIf::spawn(
            strategy,
            || self.send_once(method.clone(), url, headers, body.clone(), timeout),
            |e: &TransportError| {
                let retry = e.is_retryable();
                if retry {
                    warn!("Transport error on {}: {}, retrying", url, e);
                }
                retry
            },
        )
        .await
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<String>,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        let ua = self.identities.pick();
        debug!("{} {} as {:.40}…", method, url, ua);

        let mut req = self
            .inner
            .request(method, url)
            .headers(headers.clone())
            .header(USER_AGENT, HeaderValue::from_str(ua)?)
            .timeout(timeout);
        if let Some(body) = body {
            req = req.header(CONTENT_TYPE, FORM_CONTENT_TYPE).body(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await?;
        let raw = RawResponse {
            status,
            headers,
            body,
        };

        if status.is_success() {
            Ok(raw)
        } else {
            Err(TransportError::Status(Box::new(raw)))
        }
    }
}

/// Headers the search endpoint expects from its own XHR front-end.
pub fn api_headers(landing_url: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));
    headers.insert(
        HeaderName::from_static("x-requested-with"),
        HeaderValue::from_static("XMLHttpRequest"),
    );
    if let Ok(referer) = HeaderValue::from_str(landing_url) {
        headers.insert(REFERER, referer);
    }
    if let Ok(url) = url::Url::parse(landing_url) {
        if let Ok(origin) = HeaderValue::from_str(&url.origin().ascii_serialization()) {
            headers.insert(ORIGIN, origin);
        }
    }
    headers
}

/// Headers for the landing-page GET.
pub fn landing_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));
    headers
}
