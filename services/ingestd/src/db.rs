//! Pool construction and the idempotent schema.

use crate::config::Config;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::warn;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Connect with one slot per partition plus write/headroom connections.
/// Every connection applies the `synchronous_commit` session setting;
/// failure to apply it is logged, not fatal.
pub async fn create_pool(cfg: &Config) -> Result<PgPool, sqlx::Error> {
    let width = (cfg.partition_count + cfg.db_write_concurrency + 2) as u32;
    let session_sql = format!(
        "SET synchronous_commit = '{}'",
        if cfg.pg_sync_commit_on { "on" } else { "off" }
    );
    PgPoolOptions::new()
        .max_connections(width)
        .after_connect(move |conn, _meta| {
            let session_sql = session_sql.clone();
            Box::pin(async move {
                if let Err(err) = sqlx::query(&session_sql).execute(conn).await {
                    warn!(error = %err, "could not apply session settings, using server defaults");
                }
                Ok(())
            })
        })
        .connect(&cfg.database_url)
        .await
}

pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}
