//! Run metrics: per-worker counters, smoothed throughput, ETA.
//!
//! Workers report through their progress callback; the health surface
//! and the progress log both read [`MetricsRegistry::snapshot`], which
//! recomputes the throughput EMA against the wall-clock delta since the
//! previous snapshot.

use crate::repo::checkpoints::{CheckpointStatus, WorkerCheckpoint};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

/// The feed is a bounded dump of this many events; ETA counts down to it.
pub const TARGET_EVENT_COUNT: i64 = 3_000_000;
const EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetrics {
    pub worker_id: i32,
    pub fetched_count: i64,
    pub inserted_count: i64,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_fetched: i64,
    pub total_inserted: i64,
    /// EMA of inserted events per second.
    pub throughput_eps: f64,
    pub eta_seconds: Option<f64>,
    pub active_workers: usize,
    pub workers: Vec<WorkerMetrics>,
}

struct Inner {
    workers: BTreeMap<i32, (i64, i64, CheckpointStatus)>,
    ema_eps: f64,
    last_tick: Option<(Instant, i64)>,
}

pub struct MetricsRegistry {
    started_at: Instant,
    inner: Mutex<Inner>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        MetricsRegistry {
            started_at: Instant::now(),
            inner: Mutex::new(Inner {
                workers: BTreeMap::new(),
                ema_eps: 0.0,
                last_tick: None,
            }),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Register the checkpoints found at startup so resumed progress
    /// shows up before the first page lands.
    pub fn seed(&self, checkpoints: &[WorkerCheckpoint]) {
        let mut inner = self.lock();
        for cp in checkpoints {
            inner.workers.insert(
                cp.worker_id,
                (cp.fetched_count, cp.inserted_count, cp.status),
            );
        }
    }

    pub fn update_worker(&self, cp: &WorkerCheckpoint) {
        self.lock().workers.insert(
            cp.worker_id,
            (cp.fetched_count, cp.inserted_count, cp.status),
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut inner = self.lock();
        let total_fetched: i64 = inner.workers.values().map(|(f, _, _)| f).sum();
        let total_inserted: i64 = inner.workers.values().map(|(_, i, _)| i).sum();

        let now = Instant::now();
        if let Some((last_at, last_inserted)) = inner.last_tick {
            let dt = now.duration_since(last_at).as_secs_f64();
            if dt > 0.0 {
                let instantaneous = (total_inserted - last_inserted) as f64 / dt;
                inner.ema_eps = EMA_ALPHA * instantaneous + (1.0 - EMA_ALPHA) * inner.ema_eps;
            }
        }
        inner.last_tick = Some((now, total_inserted));

        let eta_seconds = (inner.ema_eps > 0.0)
            .then(|| (TARGET_EVENT_COUNT - total_inserted).max(0) as f64 / inner.ema_eps);
        let workers: Vec<WorkerMetrics> = inner
            .workers
            .iter()
            .map(|(&worker_id, &(fetched_count, inserted_count, status))| WorkerMetrics {
                worker_id,
                fetched_count,
                inserted_count,
                status: status.as_str(),
            })
            .collect();
        let active_workers = inner
            .workers
            .values()
            .filter(|(_, _, status)| *status == CheckpointStatus::Running)
            .count();

        MetricsSnapshot {
            total_fetched,
            total_inserted,
            throughput_eps: inner.ema_eps,
            eta_seconds,
            active_workers,
            workers,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-update;
        // the counters themselves stay usable.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
