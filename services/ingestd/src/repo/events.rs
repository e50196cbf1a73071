//! Event rows: bulk insert and read-back for submission.

use ingest_core::page::IngestEvent;
use sqlx::{PgPool, Postgres, Transaction};

/// Bulk insert via array unnest: one bind each for ids, timestamps, and
/// payload JSON text (cast to `jsonb` server-side). Duplicate ids fall
/// out on the primary key. Empty input issues no query and returns 0.
pub async fn insert_events(
    tx: &mut Transaction<'_, Postgres>,
    events: &[IngestEvent],
) -> Result<i64, sqlx::Error> {
    if events.is_empty() {
        return Ok(0);
    }
    let mut ids = Vec::with_capacity(events.len());
    let mut timestamps = Vec::with_capacity(events.len());
    let mut payloads = Vec::with_capacity(events.len());
    for event in events {
        ids.push(event.event_id.clone());
        timestamps.push(event.timestamp_ms);
        payloads.push(event.payload.to_string());
    }
    let result = sqlx::query(
        r#"INSERT INTO ingested_events (event_id, timestamp_ms, payload)
           SELECT u.event_id, u.timestamp_ms, u.payload::jsonb
           FROM UNNEST($1::text[], $2::bigint[], $3::text[]) AS u(event_id, timestamp_ms, payload)
           ON CONFLICT (event_id) DO NOTHING"#,
    )
    .bind(&ids)
    .bind(&timestamps)
    .bind(&payloads)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() as i64)
}

pub async fn count_events(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM ingested_events")
        .fetch_one(pool)
        .await
}

/// Every ingested id, oldest first.
pub async fn fetch_all_event_ids(pool: &PgPool) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT event_id FROM ingested_events ORDER BY timestamp_ms ASC, event_id ASC",
    )
    .fetch_all(pool)
    .await
}
