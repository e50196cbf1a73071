//! One-off API probe (`MODE=explore`).
//!
//! Fetches a single documented-endpoint page and reports what came back:
//! envelope shape, rate-limit headers, event timestamp range, and the
//! timestamp a returned cursor decodes to. Handy for eyeballing a feed
//! before committing to a multi-hour run.

use crate::config::Config;
use crate::http::HttpClient;
use crate::retry::with_retry;
use ingest_core::cursor::decode_cursor_ts;
use ingest_core::page::normalize_page;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const PROBE_LIMIT: usize = 5;

#[derive(Debug, Error)]
pub enum ExploreError {
    #[error("building HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error(transparent)]
    Http(#[from] crate::http::HttpError),
}

pub async fn run(cfg: &Config) -> Result<(), ExploreError> {
    let http = HttpClient::new(
        Duration::from_millis(cfg.request_timeout_ms),
        cfg.http_pool_width(),
    )?;
    let url = format!("{}/events?limit={PROBE_LIMIT}", cfg.api_base_url);
    let headers = [("X-API-Key", cfg.api_key.as_str())];
    let response = with_retry(cfg.retry_policy(), "explore probe", || {
        http.get(&url, &headers)
    })
    .await?;

    for header in ["x-ratelimit-remaining", "x-ratelimit-limit", "x-ratelimit-reset"] {
        if let Some(value) = response.headers.get(header).and_then(|v| v.to_str().ok()) {
            info!(header, value, "rate-limit header");
        }
    }

    let Some(body) = response.body.as_json() else {
        info!("response body is not JSON");
        return Ok(());
    };
    info!(shape = envelope_shape(body), "envelope");

    let page = normalize_page(body);
    let timestamps: Vec<i64> = page.events.iter().map(|e| e.timestamp_ms).collect();
    info!(
        events = page.events.len(),
        has_more = page.has_more,
        total = ?page.total,
        newest_ts = ?timestamps.iter().max(),
        oldest_ts = ?timestamps.iter().min(),
        "page"
    );
    if let Some(cursor) = &page.next_cursor {
        info!(cursor_ts = ?decode_cursor_ts(cursor), "next cursor decodes to");
    }
    Ok(())
}

fn envelope_shape(body: &Value) -> &'static str {
    match body.get("data") {
        Some(data) if data.is_object() => "nested",
        Some(data) if data.is_array() => "flat",
        _ => "unrecognized",
    }
}
