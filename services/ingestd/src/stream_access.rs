//! Short-lived stream credentials for the primary feed path.
//!
//! The dashboard's stream-access endpoint hands out `{endpoint,
//! tokenHeader, token, expiresIn}` grants when asked with browser-looking
//! headers and the API key presented both as cookie and header. Grants
//! are cached and refreshed 60 s ahead of their stated expiry.
//!
//! # Refresh coalescing
//! `get()` holds the cache mutex across the refresh round-trip, so any
//! number of concurrent callers produce exactly one upstream request and
//! all observe its result.

use crate::http::{HttpClient, HttpError};
use crate::retry::with_retry;
use ingest_core::retry::RetryPolicy;
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Feed path used when a grant omits its endpoint.
pub const DEFAULT_FEED_PATH: &str = "/events/d4ta/x7k9/feed";
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

const STREAM_ACCESS_PATH: &str = "/internal/dashboard/stream-access";
const DEFAULT_TOKEN_HEADER: &str = "X-Stream-Token";
const DEFAULT_EXPIRES_IN_SECS: i64 = 300;
/// Refresh this far ahead of the stated expiry.
const EXPIRY_BUFFER_MS: i64 = 60_000;

#[derive(Debug, Clone)]
pub struct StreamAccess {
    pub endpoint: String,
    pub token_header: String,
    pub token: String,
    pub expires_in_secs: i64,
}

#[derive(Debug, Error)]
pub enum StreamAccessError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("stream-access response missing {0}")]
    Malformed(&'static str),
}

struct CachedAccess {
    access: StreamAccess,
    refresh_at_ms: i64,
}

pub struct StreamAccessManager {
    http: Arc<HttpClient>,
    origin: String,
    api_key: String,
    policy: RetryPolicy,
    cache: Mutex<Option<CachedAccess>>,
}

impl StreamAccessManager {
    pub fn new(http: Arc<HttpClient>, origin: String, api_key: String, policy: RetryPolicy) -> Self {
        StreamAccessManager {
            http,
            origin,
            api_key,
            policy,
            cache: Mutex::new(None),
        }
    }

    /// Return valid credentials, refreshing at most once across
    /// concurrent callers.
    pub async fn get(&self) -> Result<StreamAccess, StreamAccessError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if now_ms() < cached.refresh_at_ms {
                return Ok(cached.access.clone());
            }
        }
        let access = self.refresh().await?;
        let refresh_at_ms = now_ms() + access.expires_in_secs * 1000 - EXPIRY_BUFFER_MS;
        *cache = Some(CachedAccess {
            access: access.clone(),
            refresh_at_ms,
        });
        info!(
            endpoint = %access.endpoint,
            expires_in_secs = access.expires_in_secs,
            "stream credentials refreshed"
        );
        Ok(access)
    }

    /// Drop the cached grant; the next `get()` refreshes. Called by the
    /// source when the feed answers 401/403.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    async fn refresh(&self) -> Result<StreamAccess, StreamAccessError> {
        let url = format!("{}{}", self.origin, STREAM_ACCESS_PATH);
        let referer = format!("{}/dashboard", self.origin);
        let cookie = format!("dashboard_api_key={}", self.api_key);
        let headers = [
            ("Origin", self.origin.as_str()),
            ("Referer", referer.as_str()),
            ("User-Agent", BROWSER_USER_AGENT),
            ("Cookie", cookie.as_str()),
            ("X-API-Key", self.api_key.as_str()),
        ];
        let body = json!({});
        let response = with_retry(self.policy, "stream-access refresh", || {
            self.http.post_json(&url, &body, &headers)
        })
        .await?;

        let body = response
            .body
            .as_json()
            .ok_or(StreamAccessError::Malformed("JSON body"))?;
        let grant = body
            .get("streamAccess")
            .ok_or(StreamAccessError::Malformed("streamAccess"))?;
        let token = grant
            .get("token")
            .and_then(Value::as_str)
            .ok_or(StreamAccessError::Malformed("streamAccess.token"))?;
        Ok(StreamAccess {
            endpoint: grant
                .get("endpoint")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_FEED_PATH)
                .to_owned(),
            token_header: grant
                .get("tokenHeader")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_TOKEN_HEADER)
                .to_owned(),
            token: token.to_owned(),
            expires_in_secs: grant
                .get("expiresIn")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_EXPIRES_IN_SECS),
        })
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
