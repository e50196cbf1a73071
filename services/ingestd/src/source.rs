//! Unified page source.
//!
//! Primary path: the credentialed stream endpoint, asked for with the
//! same headers a browser dashboard would send. On 401/403 the grant is
//! refreshed once; if the primary still fails, the source latches onto
//! the documented `/events` endpoint for the remainder of the process.
//! The latch is monotonic to avoid flapping between paths.
//!
//! Every request pays the shared rate limiter's pre-delay first, and
//! every response (success or 429) feeds state back into it.

use crate::http::{HttpClient, HttpError, HttpResponse};
use crate::rate_limiter::RateLimiter;
use crate::retry::with_retry;
use crate::stream_access::{BROWSER_USER_AGENT, StreamAccessManager};
use ingest_core::page::{Page, normalize_page};
use ingest_core::retry::RetryPolicy;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct FetchParams {
    pub limit: usize,
    pub cursor: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("stream credentials: {0}")]
    Credentials(#[from] crate::stream_access::StreamAccessError),
}

impl SourceError {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            SourceError::Http(err) => Some(err.status),
            SourceError::Credentials(_) => None,
        }
    }
}

pub struct EventSource {
    http: Arc<HttpClient>,
    limiter: Arc<RateLimiter>,
    credentials: Arc<StreamAccessManager>,
    policy: RetryPolicy,
    origin: String,
    api_base_url: String,
    api_key: String,
    fallback_latched: AtomicBool,
}

impl EventSource {
    pub fn new(
        http: Arc<HttpClient>,
        limiter: Arc<RateLimiter>,
        credentials: Arc<StreamAccessManager>,
        policy: RetryPolicy,
        origin: String,
        api_base_url: String,
        api_key: String,
    ) -> Self {
        EventSource {
            http,
            limiter,
            credentials,
            policy,
            origin,
            api_base_url,
            api_key,
            fallback_latched: AtomicBool::new(false),
        }
    }

    pub fn fallback_latched(&self) -> bool {
        self.fallback_latched.load(Ordering::SeqCst)
    }

    /// Fetch one page through whichever path is currently live.
    pub async fn fetch_page(&self, params: FetchParams) -> Result<Page, SourceError> {
        self.limiter.pre_request_delay().await;

        if !self.fallback_latched() {
            match self.fetch_primary(&params).await {
                Ok(page) => return Ok(page),
                Err(err) => match err.http_status() {
                    Some(status @ (401 | 403)) => {
                        warn!(status, "primary path rejected credentials, refreshing once");
                        self.credentials.invalidate().await;
                        match self.fetch_primary(&params).await {
                            Ok(page) => return Ok(page),
                            Err(second) => self.latch_fallback(&second),
                        }
                    }
                    Some(_) => return Err(err),
                    // Credential acquisition itself failed; the documented
                    // endpoint needs none of it.
                    None => self.latch_fallback(&err),
                },
            }
        }

        self.fetch_fallback(&params).await
    }

    fn latch_fallback(&self, cause: &SourceError) {
        self.fallback_latched.store(true, Ordering::SeqCst);
        info!(
            error = %cause,
            "primary stream path disabled for this run; using documented /events endpoint"
        );
    }

    async fn fetch_primary(&self, params: &FetchParams) -> Result<Page, SourceError> {
        let access = self.credentials.get().await?;
        let url = build_url(&format!("{}{}", self.origin, access.endpoint), params);
        let referer = format!("{}/dashboard", self.origin);
        let headers = [
            (access.token_header.as_str(), access.token.as_str()),
            ("X-API-Key", self.api_key.as_str()),
            ("Origin", self.origin.as_str()),
            ("Referer", referer.as_str()),
            ("User-Agent", BROWSER_USER_AGENT),
        ];
        let response = self.execute(&url, &headers).await?;
        Ok(self.accept(response).await)
    }

    async fn fetch_fallback(&self, params: &FetchParams) -> Result<Page, SourceError> {
        let url = build_url(&format!("{}/events", self.api_base_url), params);
        let headers = [("X-API-Key", self.api_key.as_str())];
        let response = self.execute(&url, &headers).await?;
        Ok(self.accept(response).await)
    }

    /// Run one GET through the retry schedule, reporting every 429 to the
    /// shared limiter as it happens (the retry wrapper then waits out
    /// `Retry-After` or the backoff schedule before the next attempt).
    async fn execute(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, HttpError> {
        with_retry(self.policy, "fetch events page", || async {
            let result = self.http.get(url, headers).await;
            if let Err(err) = &result {
                if err.status == 429 {
                    self.limiter.record_429().await;
                }
            }
            result
        })
        .await
    }

    async fn accept(&self, response: HttpResponse) -> Page {
        self.limiter.observe_headers(&response.headers).await;
        self.limiter.record_success().await;
        match response.body.as_json() {
            Some(body) => normalize_page(body),
            None => Page::empty(),
        }
    }
}

impl crate::worker::PageSource for EventSource {
    fn fetch_page(
        &self,
        params: FetchParams,
    ) -> impl std::future::Future<Output = Result<Page, SourceError>> + Send {
        EventSource::fetch_page(self, params)
    }
}

fn build_url(base: &str, params: &FetchParams) -> String {
    // Cursors are base64url and timestamps are integers; nothing here
    // needs percent-encoding.
    let mut url = format!("{base}?limit={}", params.limit);
    if let Some(cursor) = &params.cursor {
        url.push_str("&cursor=");
        url.push_str(cursor);
    }
    if let Some(since) = params.since {
        url.push_str(&format!("&since={since}"));
    }
    if let Some(until) = params.until {
        url.push_str(&format!("&until={until}"));
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_includes_only_set_params() {
        let base = "https://api.example.com/api/v1/events";
        let bare = build_url(
            base,
            &FetchParams {
                limit: 100,
                ..FetchParams::default()
            },
        );
        assert_eq!(bare, "https://api.example.com/api/v1/events?limit=100");

        let full = build_url(
            base,
            &FetchParams {
                limit: 5000,
                cursor: Some("abc_123".to_owned()),
                since: Some(1),
                until: Some(2),
            },
        );
        assert_eq!(
            full,
            "https://api.example.com/api/v1/events?limit=5000&cursor=abc_123&since=1&until=2"
        );
    }
}
