//! Failure classification and backoff arithmetic for upstream calls.
//!
//! Status 0 stands for transport-level failures (timeout, DNS, reset,
//! abort). The async executor that actually sleeps lives in the daemon;
//! this module only decides *whether* and *how long*.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Transient failures worth another attempt: rate limiting, server
/// errors, and transport faults. Everything else is fatal to the call.
pub fn is_retryable_status(status: u16) -> bool {
    status == 0 || status == 429 || status >= 500
}

/// Jitter applies to server/transport faults but not to 429, where the
/// schedule (or `Retry-After`) already paces the caller.
pub fn jitter_applies(status: u16) -> bool {
    status == 0 || status >= 500
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 250,
            max_delay_ms: 15_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after failed attempt `attempt` (1-indexed):
    /// `base · 2^(attempt-1)`, up to 30% multiplicative jitter where it
    /// applies, clamped to `max_delay_ms`. `jitter_unit` is a uniform
    /// sample from `[0, 1)`.
    pub fn backoff(&self, attempt: u32, status: u16, jitter_unit: f64) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let exponential = self.base_delay_ms.saturating_mul(1u64 << shift);
        let delayed = if jitter_applies(status) {
            (exponential as f64 * (1.0 + 0.3 * jitter_unit)) as u64
        } else {
            exponential
        };
        Duration::from_millis(delayed.min(self.max_delay_ms))
    }
}

/// Parse a `Retry-After` header value against `now`.
///
/// Integer form is delta-seconds and must be positive; HTTP-date form
/// must lie in the future. Anything else is `None`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        return (secs > 0).then(|| Duration::from_secs(secs as u64));
    }
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta_ms = when
        .with_timezone(&Utc)
        .signed_duration_since(now)
        .num_milliseconds();
    (delta_ms > 0).then(|| Duration::from_millis(delta_ms as u64))
}
