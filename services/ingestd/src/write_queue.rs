//! Bounded transactional writer pool between workers and the store.
//!
//! Two semaphores bound the pipeline: `backlog` caps accepted-but-
//! unfinished tasks (enqueueing blocks when it is full, which is the
//! backpressure), `writers` caps transactions actually executing. Each
//! task runs `BEGIN → bulk insert → checkpoint upsert → COMMIT` on its
//! own spawned task, so a cancelled worker never leaves a transaction
//! half-awaited; rollback on error happens when the transaction drops.

use crate::repo::checkpoints::{self, WorkerCheckpoint};
use crate::repo::events;
use ingest_core::page::IngestEvent;
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};

#[derive(Debug, Clone)]
pub struct WriteBatch {
    pub events: Vec<IngestEvent>,
    /// Checkpoint state as of this batch; `inserted_count` is the base
    /// value, the transaction adds what it actually inserted.
    pub checkpoint: WorkerCheckpoint,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("store: {0}")]
    Db(#[from] sqlx::Error),
    #[error("write task failed: {0}")]
    Task(String),
}

pub struct WriteQueue {
    pool: PgPool,
    writers: Arc<Semaphore>,
    backlog: Arc<Semaphore>,
    in_flight: Arc<InFlight>,
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl WriteQueue {
    pub fn new(pool: PgPool, write_concurrency: usize, max_pending: usize) -> Self {
        WriteQueue {
            pool,
            writers: Arc::new(Semaphore::new(write_concurrency.max(1))),
            backlog: Arc::new(Semaphore::new(max_pending.max(1))),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Tasks accepted but not yet committed or rolled back.
    pub fn pending(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Commit `batch` in a single transaction and return the rows
    /// actually inserted (post-conflict). Blocks for a backlog slot when
    /// the queue is full.
    pub async fn submit(&self, batch: WriteBatch) -> Result<i64, WriteError> {
        let slot = Arc::clone(&self.backlog)
            .acquire_owned()
            .await
            .map_err(|e| WriteError::Task(e.to_string()))?;
        self.in_flight.count.fetch_add(1, Ordering::SeqCst);

        let pool = self.pool.clone();
        let writers = Arc::clone(&self.writers);
        let tracker = Arc::clone(&self.in_flight);
        let handle = tokio::spawn(async move {
            let _slot = slot;
            let result = async {
                let _writer = writers
                    .acquire_owned()
                    .await
                    .map_err(|e| WriteError::Task(e.to_string()))?;
                execute_batch(&pool, batch).await
            }
            .await;
            if tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
                tracker.drained.notify_waiters();
            }
            result
        });

        match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(WriteError::Task(join_err.to_string())),
        }
    }

    /// Wait until every in-flight transaction has settled.
    pub async fn drain(&self) {
        while self.pending() > 0 {
            let notified = self.in_flight.drained.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl crate::worker::BatchSink for WriteQueue {
    fn submit(
        &self,
        batch: WriteBatch,
    ) -> impl std::future::Future<Output = Result<i64, WriteError>> + Send {
        WriteQueue::submit(self, batch)
    }
}

async fn execute_batch(pool: &PgPool, batch: WriteBatch) -> Result<i64, WriteError> {
    let mut tx = pool.begin().await?;
    let inserted = events::insert_events(&mut tx, &batch.events).await?;
    let mut checkpoint = batch.checkpoint;
    checkpoint.inserted_count += inserted;
    checkpoints::upsert(&mut tx, &checkpoint).await?;
    tx.commit().await?;
    Ok(inserted)
}
