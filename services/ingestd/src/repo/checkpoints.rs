//! Worker checkpoint rows.
//!
//! One row per partition. Mutable columns change only through
//! [`upsert`], which callers run inside the same transaction as the
//! batch the checkpoint describes, so the row never leads or lags its
//! events.

use ingest_core::cursor::TimeChunk;
use sqlx::{PgPool, Postgres, Row, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    Running,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointStatus::Running => "running",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerCheckpoint {
    pub worker_id: i32,
    pub chunk_start_ts: i64,
    pub chunk_end_ts: i64,
    pub cursor: Option<String>,
    pub last_ts: Option<i64>,
    pub fetched_count: i64,
    pub inserted_count: i64,
    pub status: CheckpointStatus,
}

impl WorkerCheckpoint {
    pub fn new(worker_id: i32, chunk: TimeChunk) -> Self {
        WorkerCheckpoint {
            worker_id,
            chunk_start_ts: chunk.start_ts,
            chunk_end_ts: chunk.end_ts,
            cursor: None,
            last_ts: None,
            fetched_count: 0,
            inserted_count: 0,
            status: CheckpointStatus::Running,
        }
    }
}

pub async fn load_all(pool: &PgPool) -> Result<Vec<WorkerCheckpoint>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT worker_id, chunk_start_ts, chunk_end_ts, cursor, last_ts,
                fetched_count, inserted_count, status
         FROM worker_checkpoints ORDER BY worker_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| WorkerCheckpoint {
            worker_id: row.get("worker_id"),
            chunk_start_ts: row.get("chunk_start_ts"),
            chunk_end_ts: row.get("chunk_end_ts"),
            cursor: row.get("cursor"),
            last_ts: row.get("last_ts"),
            fetched_count: row.get("fetched_count"),
            inserted_count: row.get("inserted_count"),
            status: CheckpointStatus::parse(row.get::<&str, _>("status"))
                .unwrap_or(CheckpointStatus::Running),
        })
        .collect())
}

/// Seed one row per chunk; rows that already exist keep their progress.
pub async fn initialize(pool: &PgPool, chunks: &[TimeChunk]) -> Result<(), sqlx::Error> {
    for (i, chunk) in chunks.iter().enumerate() {
        sqlx::query(
            "INSERT INTO worker_checkpoints (worker_id, chunk_start_ts, chunk_end_ts)
             VALUES ($1, $2, $3)
             ON CONFLICT (worker_id) DO NOTHING",
        )
        .bind(i as i32)
        .bind(chunk.start_ts)
        .bind(chunk.end_ts)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Discard all checkpoint state (partition-count change invalidates it).
pub async fn reset_all(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("TRUNCATE worker_checkpoints")
        .execute(pool)
        .await?;
    Ok(())
}

/// Update all mutable columns by primary key, inside the caller's
/// transaction.
pub async fn upsert(
    tx: &mut Transaction<'_, Postgres>,
    cp: &WorkerCheckpoint,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO worker_checkpoints
             (worker_id, chunk_start_ts, chunk_end_ts, cursor, last_ts,
              fetched_count, inserted_count, status, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
         ON CONFLICT (worker_id) DO UPDATE SET
             cursor = EXCLUDED.cursor,
             last_ts = EXCLUDED.last_ts,
             fetched_count = EXCLUDED.fetched_count,
             inserted_count = EXCLUDED.inserted_count,
             status = EXCLUDED.status,
             updated_at = now()",
    )
    .bind(cp.worker_id)
    .bind(cp.chunk_start_ts)
    .bind(cp.chunk_end_ts)
    .bind(&cp.cursor)
    .bind(cp.last_ts)
    .bind(cp.fetched_count)
    .bind(cp.inserted_count)
    .bind(cp.status.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Best-effort terminal marker written by the orchestrator after a
/// worker's task rejects.
pub async fn mark_failed(pool: &PgPool, worker_id: i32) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE worker_checkpoints SET status = 'failed', updated_at = now()
         WHERE worker_id = $1",
    )
    .bind(worker_id)
    .execute(pool)
    .await?;
    Ok(())
}
