//! Async retry executor over the transport.
//!
//! Classification and delay arithmetic live in `ingest_core::retry`;
//! this wrapper supplies the clock, the jitter sample, and the sleeps.
//! A server-provided `Retry-After` overrides the computed schedule.

use crate::http::HttpError;
use ingest_core::retry::{RetryPolicy, is_retryable_status};
use std::future::Future;
use tracing::warn;

pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, HttpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HttpError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable_status(err.status) || attempt >= policy.max_attempts.max(1) {
                    return Err(err);
                }
                let delay = err
                    .retry_after
                    .unwrap_or_else(|| policy.backoff(attempt, err.status, rand::random::<f64>()));
                warn!(
                    what,
                    attempt,
                    status = err.status,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fail(status: u16) -> HttpError {
        HttpError {
            status,
            method: "GET",
            url: "http://test/".to_owned(),
            retry_after: None,
            detail: String::new(),
        }
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(quick_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 { Err(fail(503)) } else { Ok("done") }
            }
        })
        .await;
        assert_eq!(result.expect("eventual success"), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_status_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(quick_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(fail(404)) }
        })
        .await;
        assert_eq!(result.expect_err("fatal").status, 404);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(quick_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(fail(500)) }
        })
        .await;
        assert_eq!(result.expect_err("exhausted").status, 500);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_after_hint_takes_precedence() {
        let calls = AtomicU32::new(0);
        let started = std::time::Instant::now();
        let result = with_retry(quick_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    let mut err = fail(429);
                    err.retry_after = Some(std::time::Duration::from_millis(50));
                    Err(err)
                } else {
                    Ok(())
                }
            }
        })
        .await;
        result.expect("success after hint");
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));
    }
}
