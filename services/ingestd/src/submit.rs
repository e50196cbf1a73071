//! Final submission collaborator.
//!
//! Streams every ingested event id out of the store and posts them
//! newline-joined as `text/plain` to the submissions endpoint. Narrow by
//! design: the ingestion run never depends on it.

use crate::http::{HttpClient, HttpError};
use crate::repo::events;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("store: {0}")]
    Db(#[from] sqlx::Error),
    #[error("invalid submission URL: {0}")]
    InvalidUrl(String),
}

/// Submit all ingested ids; returns how many were sent.
pub async fn submit_ingested_ids(
    http: &HttpClient,
    pool: &PgPool,
    origin: &str,
    api_key: &str,
    github_repo_url: &str,
) -> Result<usize, SubmitError> {
    let ids = events::fetch_all_event_ids(pool).await?;
    let count = ids.len();

    let mut url = reqwest::Url::parse(&format!("{origin}/api/v1/submissions"))
        .map_err(|e| SubmitError::InvalidUrl(e.to_string()))?;
    url.query_pairs_mut().append_pair("github_repo", github_repo_url);

    let body = ids.join("\n");
    let response = http
        .post_text(url.as_str(), body, &[("X-API-Key", api_key)])
        .await?;
    info!(count, status = response.status, "submission delivered");
    Ok(count)
}
