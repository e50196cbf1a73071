//! Process-wide rate limiter shared by all workers.
//!
//! Wraps the pure state machine in a mutex and turns its verdicts into
//! sleeps. The critical sections are a handful of integer operations, so
//! contention across eight workers is negligible; the sleep itself always
//! happens outside the lock.

use ingest_core::rate::RateLimitState;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const LIMIT_HEADER: &str = "x-ratelimit-limit";
const RESET_HEADER: &str = "x-ratelimit-reset";

#[derive(Default)]
pub struct RateLimiter {
    state: Mutex<RateLimitState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for whatever the current state demands before a request.
    pub async fn pre_request_delay(&self) {
        let wait_ms = self.state.lock().await.pre_delay_ms(now_ms());
        if wait_ms > 0 {
            debug!(wait_ms, "pacing before request");
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }
    }

    /// Fold quota headers from a response into the shared state.
    pub async fn observe_headers(&self, headers: &HeaderMap) {
        let remaining = header_i64(headers, REMAINING_HEADER);
        let limit = header_i64(headers, LIMIT_HEADER);
        let reset = header_i64(headers, RESET_HEADER);
        if remaining.is_some() || limit.is_some() || reset.is_some() {
            self.state
                .lock()
                .await
                .observe_headers(remaining, limit, reset, now_ms());
        }
    }

    pub async fn record_429(&self) {
        let mut state = self.state.lock().await;
        state.record_429(now_ms());
        warn!(
            adaptive_delay_ms = state.adaptive_delay_ms(),
            consecutive_429s = state.consecutive_429s(),
            "rate limited by upstream"
        );
    }

    pub async fn record_success(&self) {
        self.state.lock().await.record_success();
    }

    pub async fn adaptive_delay_ms(&self) -> u64 {
        self.state.lock().await.adaptive_delay_ms()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
