//! Per-partition ingestion worker.
//!
//! Each worker owns one timeline chunk `[chunk_start_ts, chunk_end_ts)`
//! and walks it newest-first, entering through a cursor forged at the
//! chunk's upper bound. The next page goes on the wire *before* the
//! current batch's transaction resolves (one fetch in flight per worker,
//! never more), but batch B+1 is never enqueued before B commits.
//!
//! # Recovery
//! A 400 mid-walk means the cursor expired server-side; the worker
//! re-forges one at the last timestamp it saw and carries on. Everything
//! else propagates to the orchestrator.

use crate::ShutdownFlag;
use crate::repo::checkpoints::{CheckpointStatus, WorkerCheckpoint};
use crate::source::{FetchParams, SourceError};
use crate::write_queue::{WriteBatch, WriteError};
use ingest_core::cursor::forge_cursor;
use ingest_core::page::Page;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Anything that serves pages. The daemon wires in [`EventSource`];
/// tests script one.
///
/// [`EventSource`]: crate::source::EventSource
pub trait PageSource: Send + Sync + 'static {
    fn fetch_page(
        &self,
        params: FetchParams,
    ) -> impl Future<Output = Result<Page, SourceError>> + Send;
}

/// Anything that commits a batch and its checkpoint atomically,
/// returning the number of rows actually inserted.
pub trait BatchSink: Send + Sync + 'static {
    fn submit(&self, batch: WriteBatch) -> impl Future<Output = Result<i64, WriteError>> + Send;
}

pub struct WorkerContext<S, Q> {
    pub source: Arc<S>,
    pub sink: Arc<Q>,
    /// Page size requested from the API; also the insert batch size.
    pub page_limit: usize,
    pub stop: ShutdownFlag,
    pub progress: Arc<dyn Fn(&WorkerCheckpoint) + Send + Sync>,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("fetch task failed: {0}")]
    FetchTask(String),
}

impl WorkerError {
    fn http_status(&self) -> Option<u16> {
        match self {
            WorkerError::Source(err) => err.http_status(),
            _ => None,
        }
    }
}

/// Drive one partition to completion (or until stopped).
///
/// Returns the final checkpoint state; the caller decides what to do
/// with failures. Already-completed partitions return immediately.
pub async fn run_worker<S: PageSource, Q: BatchSink>(
    mut cp: WorkerCheckpoint,
    ctx: WorkerContext<S, Q>,
) -> Result<WorkerCheckpoint, WorkerError> {
    if cp.status == CheckpointStatus::Completed {
        debug!(worker = cp.worker_id, "partition already complete, skipping");
        return Ok(cp);
    }
    cp.status = CheckpointStatus::Running;
    if cp.cursor.is_none() {
        // Pages come newest-first, so enter at the upper boundary.
        cp.cursor = Some(forge_cursor(cp.chunk_end_ts));
    }

    let mut in_flight = Some(spawn_fetch(&ctx, cp.cursor.clone()));
    let mut done = false;

    while !done && !ctx.stop.is_set() {
        let Some(handle) = in_flight.take() else {
            break;
        };
        let page = match await_fetch(handle).await {
            Ok(page) => page,
            Err(err) => {
                if err.http_status() == Some(400) {
                    if let Some(last_ts) = cp.last_ts {
                        // Expired cursor: re-enter at the last seen timestamp.
                        warn!(
                            worker = cp.worker_id,
                            last_ts, "cursor rejected, re-forging and resuming"
                        );
                        cp.cursor = Some(forge_cursor(last_ts));
                        in_flight = Some(spawn_fetch(&ctx, cp.cursor.clone()));
                        continue;
                    }
                }
                return Err(err);
            }
        };

        let fetched = page.events.len();
        let mut crossed = false;
        let mut batch = Vec::with_capacity(fetched);
        let mut min_ts: Option<i64> = None;
        for event in &page.events {
            min_ts = Some(min_ts.map_or(event.timestamp_ms, |m| m.min(event.timestamp_ms)));
            if event.timestamp_ms < cp.chunk_start_ts {
                // Descending order: once a page dips below the lower
                // bound, no later page can climb back above it.
                crossed = true;
            } else if event.timestamp_ms < cp.chunk_end_ts {
                batch.push(event.clone());
            }
            // Events at or past chunk_end_ts belong to the neighbor
            // partition and are dropped here.
        }
        if crossed {
            done = true;
        }

        cp.fetched_count += fetched as i64;
        if let Some(ts) = min_ts {
            cp.last_ts = Some(ts);
        }
        cp.cursor = page.next_cursor.clone();

        // Pipeline: put the next page on the wire before awaiting the write.
        let stop_seen = ctx.stop.is_set();
        let mut scheduled_next = false;
        if page.has_more && !done && !stop_seen && cp.cursor.is_some() {
            in_flight = Some(spawn_fetch(&ctx, cp.cursor.clone()));
            scheduled_next = true;
        }

        if !batch.is_empty() {
            let inserted = ctx
                .sink
                .submit(WriteBatch {
                    events: batch,
                    checkpoint: cp.clone(),
                })
                .await?;
            cp.inserted_count += inserted;
        }
        (ctx.progress)(&cp);

        if !page.has_more || (!scheduled_next && !stop_seen) {
            done = true;
        }
    }

    if let Some(handle) = in_flight.take() {
        handle.abort();
    }

    if done {
        cp.status = CheckpointStatus::Completed;
        // The terminal status commits under the same transactional
        // protocol as every other checkpoint change.
        ctx.sink
            .submit(WriteBatch {
                events: Vec::new(),
                checkpoint: cp.clone(),
            })
            .await?;
        (ctx.progress)(&cp);
        info!(
            worker = cp.worker_id,
            fetched = cp.fetched_count,
            inserted = cp.inserted_count,
            "partition complete"
        );
    } else {
        info!(
            worker = cp.worker_id,
            fetched = cp.fetched_count,
            inserted = cp.inserted_count,
            "stopped before completion, progress checkpointed"
        );
    }
    Ok(cp)
}

fn spawn_fetch<S: PageSource, Q>(
    ctx: &WorkerContext<S, Q>,
    cursor: Option<String>,
) -> JoinHandle<Result<Page, SourceError>> {
    let source = Arc::clone(&ctx.source);
    let params = FetchParams {
        limit: ctx.page_limit,
        cursor,
        since: None,
        until: None,
    };
    tokio::spawn(async move { source.fetch_page(params).await })
}

async fn await_fetch(handle: JoinHandle<Result<Page, SourceError>>) -> Result<Page, WorkerError> {
    match handle.await {
        Ok(Ok(page)) => Ok(page),
        Ok(Err(err)) => Err(WorkerError::Source(err)),
        Err(join_err) => Err(WorkerError::FetchTask(join_err.to_string())),
    }
}
