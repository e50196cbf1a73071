//! Environment-driven configuration.
//!
//! The process environment is the sole config source. Required:
//! `DATABASE_URL`, `API_BASE_URL`, `TARGET_API_KEY`. Everything else has
//! the documented default; numeric knobs are clamped rather than rejected
//! where a sane floor/ceiling exists, but unparseable values always fail.

use ingest_core::retry::RetryPolicy;
use std::str::FromStr;
use thiserror::Error;

/// What the process does after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Run the full partitioned ingestion (the default).
    Ingest,
    /// One-off probe of the documented endpoint, then exit.
    Explore,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Normalized so it always ends in `/api/v1`.
    pub api_base_url: String,
    /// Scheme + authority of the API, for browser-path requests.
    pub origin: String,
    pub api_key: String,
    pub mode: Mode,
    pub partition_count: usize,
    pub batch_size: usize,
    pub db_write_concurrency: usize,
    pub max_pending_writes: usize,
    /// `synchronous_commit` session setting; off trades durability of the
    /// last few commits for substantially higher insert throughput.
    pub pg_sync_commit_on: bool,
    pub health_port: u16,
    pub auto_submit: bool,
    pub github_repo_url: Option<String>,
    pub min_timestamp_ms: i64,
    pub max_timestamp_ms: i64,
    pub progress_log_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },
}

const MAX_BATCH_SIZE: usize = 5_000;

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source (tests use a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = required(&lookup, "DATABASE_URL")?;
        let api_base_url = normalize_api_base_url(&required(&lookup, "API_BASE_URL")?);
        let origin = api_base_url
            .strip_suffix("/api/v1")
            .unwrap_or(&api_base_url)
            .to_owned();
        let api_key = required(&lookup, "TARGET_API_KEY")?;

        let mode = match lookup("MODE").as_deref() {
            None | Some("ingest") => Mode::Ingest,
            Some("explore") => Mode::Explore,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    var: "MODE",
                    reason: format!("expected 'ingest' or 'explore', got '{other}'"),
                });
            }
        };

        let pg_sync_commit_on = match lookup("PG_SYNC_COMMIT").as_deref() {
            None | Some("off") => false,
            Some("on") => true,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    var: "PG_SYNC_COMMIT",
                    reason: format!("expected 'on' or 'off', got '{other}'"),
                });
            }
        };

        let min_timestamp_ms = parse_or(&lookup, "MIN_TIMESTAMP_MS", 1_766_700_000_000i64)?;
        let max_timestamp_ms = parse_or(&lookup, "MAX_TIMESTAMP_MS", 1_769_900_000_000i64)?;
        if max_timestamp_ms <= min_timestamp_ms {
            return Err(ConfigError::InvalidValue {
                var: "MAX_TIMESTAMP_MS",
                reason: format!("must exceed MIN_TIMESTAMP_MS ({min_timestamp_ms})"),
            });
        }

        Ok(Config {
            database_url,
            api_base_url,
            origin,
            api_key,
            mode,
            partition_count: parse_or(&lookup, "PARTITION_COUNT", 8usize)?.max(1),
            batch_size: parse_or(&lookup, "BATCH_SIZE", MAX_BATCH_SIZE)?.clamp(1, MAX_BATCH_SIZE),
            db_write_concurrency: parse_or(&lookup, "DB_WRITE_CONCURRENCY", 2usize)?.max(1),
            max_pending_writes: parse_or(&lookup, "MAX_PENDING_WRITES", 100usize)?.max(1),
            pg_sync_commit_on,
            health_port: parse_or(&lookup, "HEALTH_PORT", 8080u16)?,
            auto_submit: parse_bool(&lookup, "AUTO_SUBMIT", false)?,
            github_repo_url: lookup("GITHUB_REPO_URL").filter(|s| !s.is_empty()),
            min_timestamp_ms,
            max_timestamp_ms,
            progress_log_interval_ms: parse_or(&lookup, "PROGRESS_LOG_INTERVAL_MS", 15_000u64)?,
            request_timeout_ms: parse_or(&lookup, "REQUEST_TIMEOUT_MS", 45_000u64)?,
            max_retries: parse_or(&lookup, "MAX_RETRIES", 8u32)?,
            retry_base_ms: parse_or(&lookup, "RETRY_BASE_MS", 250u64)?,
            retry_max_ms: parse_or(&lookup, "RETRY_MAX_MS", 15_000u64)?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            base_delay_ms: self.retry_base_ms,
            max_delay_ms: self.retry_max_ms,
        }
    }

    /// Keep-alive pool width: one slot per partition plus headroom for
    /// credential refresh and submission traffic.
    pub fn http_pool_width(&self) -> usize {
        self.partition_count + 4
    }
}

/// Trim trailing slashes and make sure the URL ends in `/api/v1`.
fn normalize_api_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.ends_with("/api/v1") {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/api/v1")
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<String, ConfigError> {
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            var: name,
            reason: format!("'{raw}': {e}"),
        }),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(name).as_deref().map(str::trim) {
        None => Ok(default),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            var: name,
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}
