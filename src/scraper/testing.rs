//! Shared fixtures for scraper tests against a wiremock server.

use crate::config::ScraperConfig;
use serde_json::{Value, json};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn landing_path() -> &'static str {
    "/zzlc/jsp/lccp.jsp"
}

pub fn api_path() -> &'static str {
    "/LcSolrSearch.go"
}

/// Zero pacing, no transport retries, three attempts per page.
pub fn test_config(server: &MockServer) -> ScraperConfig {
    ScraperConfig {
        landing_url: format!("{}{}", server.uri(), landing_path()),
        api_url: format!("{}{}", server.uri(), api_path()),
        timeout_secs: 5,
        request_delay_ms: 0,
        retry_step_ms: 0,
        jitter_min_ms: 0,
        jitter_max_ms: 0,
        max_attempts: 3,
        transport_retries: 0,
        transport_backoff_ms: 0,
        debug_dir: None,
        ..Default::default()
    }
}

pub fn record(code: &str, current_nav: &str) -> Value {
    json!({
        "id": format!("id-{code}"),
        "cpdjbm": code,
        "copy": ["", "", format!("Product {code}")],
        "cpms": format!("plain {code}"),
        "fxjgms": "Test Bank",
        "csjz": "1.0000",
        "ljjz": "--",
        "cpjz": current_nav,
    })
}

pub fn page_body(records: Vec<Value>, count: u64) -> String {
    json!({"code": "success", "List": records, "Count": count}).to_string()
}

pub fn page_is(page: u32) -> impl wiremock::Match {
    body_string_contains(format!("pagenum={page}&"))
}

pub async fn mount_landing(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(landing_path()))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "JSESSIONID=test; Path=/")
                .set_body_string("<html></html>"),
        )
        .mount(server)
        .await;
}

/// Serve `records` for `page` on every request.
pub async fn mount_page(server: &MockServer, page: u32, records: Vec<Value>, count: u64) {
    Mock::given(method("POST"))
        .and(path(api_path()))
        .and(page_is(page))
        .respond_with(ResponseTemplate::new(200).set_body_string(page_body(records, count)))
        .mount(server)
        .await;
}

pub async fn requests_for_page(server: &MockServer, page: u32) -> usize {
    let needle = format!("pagenum={page}&");
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .filter(|r| String::from_utf8_lossy(&r.body).contains(&needle))
        .count()
}
