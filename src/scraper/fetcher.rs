//! Retry state machine for one page of search results.
//!
//! Each attempt waits on the pacer, sends the search form with a fresh
//! identity and classifies the response into a typed outcome
//! (`Page` or one of the transient `FetchError` kinds). The loop switches on
//! that outcome:
//!
//! | Outcome           | Next step                                        |
//! |-------------------|--------------------------------------------------|
//! | records           | `Success`                                        |
//! | network / status  | back off `Pacer(attempt)`, retry                 |
//! | server error code | re-bootstrap session, back off `Pacer(2·attempt)`|
//! | parse error       | retry                                            |
//! | empty page        | retry (never read as end-of-data)                |
//!
//! After `max_attempts` the page is `Failed` and the caller moves on.

use crate::config::ScraperConfig;
use crate::error::{FetchError, HarvestError, TransportError};
use crate::scraper::debug_sink::DebugSink;
use crate::scraper::http_client::{HttpSession, api_headers, landing_headers};
use crate::scraper::pacer::Pacer;
use crate::scraper::parsers::{Page, parse_search_response};
use reqwest::header::{HeaderMap, SET_COOKIE};
use tracing::{debug, info, warn};
use url::form_urlencoded;

/// Fixed search filters; only `pagenum` varies between requests.
const SEARCH_FORM: &[(&str, &str)] = &[
    ("cpjglb", ""),
    ("cpyzms", "01,03"),
    ("cptzxz", ""),
    ("cpfxdj", "01,02"),
    ("cpqx", ""),
    ("mjbz", ""),
    ("cpzt", "02,04"),
    ("mjfsdm", "01,NA"),
    ("cptssx", ""),
    ("cpdjbm", ""),
    ("cpmc", ""),
    ("cpfxjg", ""),
    ("yjbjjzStart", ""),
    ("yjbjjzEnd", ""),
    ("areacode", ""),
    ("pagenum", ""),
    ("orderby", ""),
    ("code", ""),
    ("sySearch", "-1"),
    ("changeTableFlage", "0"),
];

/// Encode the search form for `page`.
pub fn search_form(page: u32) -> String {
    let page = page.to_string();
    let mut form = form_urlencoded::Serializer::new(String::new());
    for (key, value) in SEARCH_FORM {
        let value = if *key == "pagenum" { page.as_str() } else { value };
        form.append_pair(key, value);
    }
    form.finish()
}

/// Terminal state of one page request.
#[derive(Debug)]
pub enum PageOutcome {
    Success { page: Page, attempts: u32 },
    Failed { attempts: u32, last_error: FetchError },
}

pub struct PageFetcher {
    session: HttpSession,
    pacer: Pacer,
    sink: DebugSink,
    landing_url: String,
    api_url: String,
    landing_headers: HeaderMap,
    api_headers: HeaderMap,
    max_attempts: u32,
}

impl PageFetcher {
    pub fn new(config: &ScraperConfig) -> Result<Self, TransportError> {
        Ok(Self {
            session: HttpSession::new(config)?,
            pacer: Pacer::new(config),
            sink: DebugSink::new(config.debug_dir.clone()),
            landing_url: config.landing_url.clone(),
            api_url: config.api_url.clone(),
            landing_headers: landing_headers(),
            api_headers: api_headers(&config.landing_url),
            max_attempts: config.max_attempts.max(1),
        })
    }

    /// GET the landing page so the cookie jar holds a fresh session.
    pub async fn bootstrap(&self) -> Result<(), HarvestError> {
        self.pacer.wait(0).await;
        let resp = self
            .session
            .get(&self.landing_url, &self.landing_headers, self.session.default_timeout())
            .await
            .map_err(|e| HarvestError::SessionBootstrap(e.to_string()))?;

        if resp.headers.contains_key(SET_COOKIE) {
            info!("Session cookies acquired");
        } else {
            debug!("Landing page set no cookies");
        }
        Ok(())
    }

    pub async fn fetch_page(&self, page: u32) -> PageOutcome {
        let mut attempt = 0u32;

        loop {
            self.pacer.wait(attempt).await;

            let err = match self.attempt(page, attempt).await {
                Ok(result) => {
                    debug!(
                        "Page {}: {} records (attempt {})",
                        page,
                        result.records.len(),
                        attempt + 1
                    );
                    return PageOutcome::Success {
                        page: result,
                        attempts: attempt + 1,
                    };
                }
                Err(e) => e,
            };

            attempt += 1;
            warn!("Page {} attempt {}/{}: {}", page, attempt, self.max_attempts, err);

            if attempt >= self.max_attempts {
                return PageOutcome::Failed {
                    attempts: attempt,
                    last_error: err,
                };
            }

            if err.needs_rebootstrap() {
                info!("Page {}: re-initialising session", page);
                if let Err(e) = self.bootstrap().await {
                    warn!("{}", e);
                }
            }
            if let Some(factor) = err.backoff_factor() {
                self.pacer.wait(attempt * factor).await;
            }
        }
    }

    async fn attempt(&self, page: u32, attempt: u32) -> Result<Page, FetchError> {
        let response = match self
            .session
            .post(
                &self.api_url,
                &self.api_headers,
                search_form(page),
                self.session.default_timeout(),
            )
            .await
        {
            Ok(resp) => resp,
            Err(TransportError::Status(resp)) => {
                self.sink.record(page, attempt, &resp);
                return Err(FetchError::Network(format!("HTTP {}", resp.status)));
            }
            Err(e) => return Err(FetchError::Network(e.to_string())),
        };

        self.sink.record(page, attempt, &response);
        parse_search_response(response.status, &response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::testing::{
        api_path, landing_path, mount_landing, page_body, page_is, record, requests_for_page,
        test_config,
    };
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_search_form_only_varies_pagenum() {
        let one = search_form(1);
        let two = search_form(2);
        assert!(one.contains("pagenum=1&"));
        assert!(two.contains("pagenum=2&"));
        assert!(one.contains("cpzt=02%2C04"));
        assert_eq!(one.replace("pagenum=1&", ""), two.replace("pagenum=2&", ""));
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(api_path()))
            .and(page_is(1))
            .respond_with(ResponseTemplate::new(200).set_body_string(page_body(
                vec![record("A", "1.01"), record("B", "1.02")],
                2,
            )))
            .mount(&server)
            .await;

        let fetcher = PageFetcher::new(&test_config(&server)).unwrap();
        match fetcher.fetch_page(1).await {
            PageOutcome::Success { page, attempts } => {
                assert_eq!(attempts, 1);
                assert_eq!(page.records.len(), 2);
                assert_eq!(page.total_count, 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_page_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(page_is(1))
            .respond_with(ResponseTemplate::new(200).set_body_string(page_body(vec![], 250)))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(page_is(1))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(page_body(vec![record("A", "1.0")], 250)),
            )
            .with_priority(2)
            .mount(&server)
            .await;

        let fetcher = PageFetcher::new(&test_config(&server)).unwrap();
        match fetcher.fetch_page(1).await {
            PageOutcome::Success { attempts, page } => {
                assert_eq!(attempts, 2);
                assert_eq!(page.total_count, 250);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_code_rebootstraps_session() {
        let server = MockServer::start().await;
        mount_landing(&server).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"code":"error"}"#))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(page_body(vec![record("A", "1.0")], 1)),
            )
            .with_priority(2)
            .mount(&server)
            .await;

        let fetcher = PageFetcher::new(&test_config(&server)).unwrap();
        assert!(matches!(
            fetcher.fetch_page(1).await,
            PageOutcome::Success { attempts: 2, .. }
        ));

        let landing_hits = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == landing_path())
            .count();
        assert_eq!(landing_hits, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_fails_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>captcha</html>"))
            .mount(&server)
            .await;

        let config = test_config(&server);
        let fetcher = PageFetcher::new(&config).unwrap();
        match fetcher.fetch_page(7).await {
            PageOutcome::Failed {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, config.max_attempts);
                assert!(matches!(last_error, FetchError::Parse(_)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(requests_for_page(&server, 7).await, config.max_attempts as usize);
    }

    #[tokio::test]
    async fn test_http_errors_are_network_errors_and_dumped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&server);
        config.max_attempts = 2;
        config.debug_dir = Some(dir.path().to_path_buf());

        let fetcher = PageFetcher::new(&config).unwrap();
        match fetcher.fetch_page(4).await {
            PageOutcome::Failed { last_error, .. } => {
                assert!(matches!(last_error, FetchError::Network(_)))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let mut dumps: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        dumps.sort();
        assert_eq!(dumps.len(), 2);
        assert!(dumps[0].starts_with("api_response_page4_try0_"));
        assert!(dumps[1].starts_with("api_response_page4_try1_"));
    }

    #[tokio::test]
    async fn test_bootstrap_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let fetcher = PageFetcher::new(&test_config(&server)).unwrap();
        assert!(matches!(
            fetcher.bootstrap().await,
            Err(HarvestError::SessionBootstrap(_))
        ));
    }
}
