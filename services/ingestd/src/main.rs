// ingestd: parallel ingestion of a cursor-paginated event feed into
// Postgres, with crash-safe per-partition checkpoints.

use ingestd::config::{Config, Mode};
use ingestd::health::{self, HealthState};
use ingestd::http::HttpClient;
use ingestd::metrics::MetricsRegistry;
use ingestd::{ShutdownFlag, db, explore, orchestrator, submit};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("FATAL: failed to load config: {err}");
            std::process::exit(1);
        }
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?cfg.mode,
        partitions = cfg.partition_count,
        "ingestd starting"
    );

    let exit_code = match cfg.mode {
        Mode::Explore => match explore::run(&cfg).await {
            Ok(()) => 0,
            Err(err) => {
                error!(error = %err, "explore probe failed");
                1
            }
        },
        Mode::Ingest => run_ingest(cfg).await,
    };
    std::process::exit(exit_code);
}

async fn run_ingest(cfg: Config) -> i32 {
    let http = match HttpClient::new(
        Duration::from_millis(cfg.request_timeout_ms),
        cfg.http_pool_width(),
    ) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(error = %err, "failed to build HTTP client");
            return 1;
        }
    };

    info!("connecting to database...");
    let pool = match db::create_pool(&cfg).await {
        Ok(pool) => pool,
        Err(err) => {
            error!(error = %err, "failed to connect to Postgres");
            return 1;
        }
    };
    if let Err(err) = db::ensure_schema(&pool).await {
        error!(error = %err, "failed to apply schema");
        return 1;
    }
    info!("schema ready");

    let shutdown = ShutdownFlag::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.trigger();
        });
    }

    let metrics = Arc::new(MetricsRegistry::new());
    let health_task = match tokio::net::TcpListener::bind(("0.0.0.0", cfg.health_port)).await {
        Ok(listener) => {
            info!(port = cfg.health_port, "health endpoint listening");
            let router = health::build_router(HealthState {
                metrics: Arc::clone(&metrics),
            });
            Some(tokio::spawn(health::serve(
                listener,
                router,
                shutdown.clone(),
            )))
        }
        Err(err) => {
            error!(error = %err, port = cfg.health_port, "failed to bind health endpoint");
            return 1;
        }
    };

    let outcome = orchestrator::run(
        &cfg,
        pool.clone(),
        Arc::clone(&http),
        Arc::clone(&metrics),
        shutdown.clone(),
    )
    .await;

    // Tear down in reverse order: health listener, then the pool.
    shutdown.trigger();
    if let Some(task) = health_task {
        let _ = task.await;
    }

    let exit_code = match outcome {
        Ok(summary) => {
            let mut code = 0;
            if cfg.auto_submit && !summary.interrupted {
                match &cfg.github_repo_url {
                    Some(repo_url) => {
                        match submit::submit_ingested_ids(
                            &http,
                            &pool,
                            &cfg.origin,
                            &cfg.api_key,
                            repo_url,
                        )
                        .await
                        {
                            Ok(count) => info!(count, "auto-submission finished"),
                            Err(err) => {
                                error!(error = %err, "auto-submission failed");
                                code = 1;
                            }
                        }
                    }
                    None => warn!("AUTO_SUBMIT is set without GITHUB_REPO_URL, skipping"),
                }
            }
            code
        }
        Err(err) => {
            error!(error = %err, "ingestion run failed");
            1
        }
    };
    pool.close().await;
    exit_code
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
