// ingestd: pulls a bounded, cursor-paginated event feed into Postgres
// with partitioned parallel workers and crash-safe checkpoints.

pub mod config;
pub mod db;
pub mod explore;
pub mod health;
pub mod http;
pub mod metrics;
pub mod orchestrator;
pub mod rate_limiter;
pub mod repo;
pub mod retry;
pub mod source;
pub mod stream_access;
pub mod submit;
pub mod worker;
pub mod write_queue;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Process-wide stop flag: set once by the signal handler, observed by
/// workers between pages and by the health server for graceful shutdown.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<ShutdownInner>);

#[derive(Default)]
struct ShutdownInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.stopped.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.0.stopped.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is set; immediately if it already is.
    pub async fn wait(&self) {
        while !self.is_set() {
            let notified = self.0.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ShutdownFlag;

    #[tokio::test]
    async fn wait_resolves_after_trigger() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.wait().await })
        };
        flag.trigger();
        waiter.await.expect("waiter completes");
        assert!(flag.is_set());
        // Waiting on an already-set flag returns immediately.
        flag.wait().await;
    }
}
