//! Run coordination: partitioning, checkpoint reconciliation, worker
//! lifecycle, periodic progress, and drain-then-aggregate error policy.
//!
//! Worker failures never interrupt the others; they are collected while
//! the rest of the fleet finishes, the queue drains, and only then does
//! the run fail as a whole.

use crate::ShutdownFlag;
use crate::config::Config;
use crate::http::HttpClient;
use crate::metrics::MetricsRegistry;
use crate::rate_limiter::RateLimiter;
use crate::repo::checkpoints::{self, CheckpointStatus, WorkerCheckpoint};
use crate::source::EventSource;
use crate::stream_access::StreamAccessManager;
use crate::worker::{self, WorkerContext, WorkerError};
use crate::write_queue::WriteQueue;
use ingest_core::cursor::partition_timeline;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Pause between worker launches: amortizes the initial credential
/// acquisition and ramps the API up gently.
const LAUNCH_STAGGER: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct RunSummary {
    pub total_fetched: i64,
    pub total_inserted: i64,
    pub completed_workers: usize,
    pub elapsed: Duration,
    pub interrupted: bool,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("store: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{failed} of {total} workers failed; first: {first}")]
    WorkersFailed {
        failed: usize,
        total: usize,
        first: String,
    },
}

pub async fn run(
    cfg: &Config,
    pool: PgPool,
    http: Arc<HttpClient>,
    metrics: Arc<MetricsRegistry>,
    shutdown: ShutdownFlag,
) -> Result<RunSummary, OrchestratorError> {
    let started = Instant::now();
    let chunks = partition_timeline(
        cfg.min_timestamp_ms,
        cfg.max_timestamp_ms,
        cfg.partition_count,
    );

    // A different partition count means different chunk boundaries, which
    // invalidates all prior progress.
    let existing = checkpoints::load_all(&pool).await?;
    if !existing.is_empty() && existing.len() != chunks.len() {
        warn!(
            existing = existing.len(),
            partitions = chunks.len(),
            "partition count changed, resetting checkpoints"
        );
        checkpoints::reset_all(&pool).await?;
    }
    checkpoints::initialize(&pool, &chunks).await?;
    let all = checkpoints::load_all(&pool).await?;
    metrics.seed(&all);

    let limiter = Arc::new(RateLimiter::new());
    let credentials = Arc::new(StreamAccessManager::new(
        Arc::clone(&http),
        cfg.origin.clone(),
        cfg.api_key.clone(),
        cfg.retry_policy(),
    ));
    let source = Arc::new(EventSource::new(
        http,
        limiter,
        credentials,
        cfg.retry_policy(),
        cfg.origin.clone(),
        cfg.api_base_url.clone(),
        cfg.api_key.clone(),
    ));
    let queue = Arc::new(WriteQueue::new(
        pool.clone(),
        cfg.db_write_concurrency,
        cfg.max_pending_writes,
    ));

    let total = all.len();
    let pending: Vec<WorkerCheckpoint> = all
        .into_iter()
        .filter(|cp| cp.status != CheckpointStatus::Completed)
        .collect();
    info!(
        partitions = total,
        resuming = pending.len(),
        ts_min = cfg.min_timestamp_ms,
        ts_max = cfg.max_timestamp_ms,
        "starting ingestion"
    );

    let progress: Arc<dyn Fn(&WorkerCheckpoint) + Send + Sync> = {
        let metrics = Arc::clone(&metrics);
        Arc::new(move |cp| metrics.update_worker(cp))
    };

    let mut tasks: Vec<(i32, JoinHandle<Result<WorkerCheckpoint, WorkerError>>)> = Vec::new();
    for cp in pending {
        if shutdown.is_set() {
            break;
        }
        if !tasks.is_empty() {
            tokio::time::sleep(LAUNCH_STAGGER).await;
        }
        let ctx = WorkerContext {
            source: Arc::clone(&source),
            sink: Arc::clone(&queue),
            page_limit: cfg.batch_size,
            stop: shutdown.clone(),
            progress: Arc::clone(&progress),
        };
        info!(
            worker = cp.worker_id,
            chunk_start_ts = cp.chunk_start_ts,
            chunk_end_ts = cp.chunk_end_ts,
            "launching worker"
        );
        tasks.push((cp.worker_id, tokio::spawn(worker::run_worker(cp, ctx))));
    }

    let reporter = spawn_progress_reporter(
        Arc::clone(&metrics),
        Arc::clone(&queue),
        cfg.progress_log_interval_ms,
    );

    let mut failures: Vec<(i32, String)> = Vec::new();
    let mut completed_workers = 0usize;
    for (worker_id, task) in tasks {
        match task.await {
            Ok(Ok(cp)) => {
                if cp.status == CheckpointStatus::Completed {
                    completed_workers += 1;
                }
            }
            Ok(Err(err)) => {
                error!(worker = worker_id, error = %err, "worker failed");
                failures.push((worker_id, err.to_string()));
            }
            Err(join_err) => {
                error!(worker = worker_id, error = %join_err, "worker task panicked");
                failures.push((worker_id, join_err.to_string()));
            }
        }
    }

    // Failures or not, everything already accepted still commits.
    queue.drain().await;
    reporter.abort();

    for (worker_id, _) in &failures {
        if let Err(err) = checkpoints::mark_failed(&pool, *worker_id).await {
            warn!(worker = worker_id, error = %err, "could not persist failed status");
        }
    }

    let snapshot = metrics.snapshot();
    if !failures.is_empty() {
        return Err(OrchestratorError::WorkersFailed {
            failed: failures.len(),
            total,
            first: failures[0].1.clone(),
        });
    }

    let interrupted = shutdown.is_set() && completed_workers < total;
    let summary = RunSummary {
        total_fetched: snapshot.total_fetched,
        total_inserted: snapshot.total_inserted,
        completed_workers,
        elapsed: started.elapsed(),
        interrupted,
    };
    if interrupted {
        info!(
            inserted = summary.total_inserted,
            completed_workers,
            "ingestion interrupted, progress checkpointed for resume"
        );
    } else {
        info!(
            fetched = summary.total_fetched,
            inserted = summary.total_inserted,
            elapsed_secs = summary.elapsed.as_secs(),
            "ingestion complete"
        );
    }
    Ok(summary)
}

fn spawn_progress_reporter(
    metrics: Arc<MetricsRegistry>,
    queue: Arc<WriteQueue>,
    interval_ms: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(interval_ms.max(1_000)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the log starts one
        // interval in.
        tick.tick().await;
        loop {
            tick.tick().await;
            let snapshot = metrics.snapshot();
            info!(
                inserted = snapshot.total_inserted,
                fetched = snapshot.total_fetched,
                throughput_eps = snapshot.throughput_eps,
                eta_secs = snapshot.eta_seconds.map_or(-1i64, |eta| eta.round() as i64),
                active_workers = snapshot.active_workers,
                pending_writes = queue.pending(),
                "progress"
            );
        }
    })
}
