//! `termscope-worker`: runs the embedding backfill against the configured
//! database and embedding backend until interrupted.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use termscope_db::{log_pool_metrics, Database, PoolConfig};
use termscope_inference::{EmbeddingBackend, OllamaEmbedder};
use termscope_jobs::{BackfillConfig, BackfillEvent, EmbeddingBackfillWorker};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const POOL_METRICS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, daily rotation)
    //   LOG_ANSI    - "true"/"false" override ANSI colors
    //   RUST_LOG    - standard env filter (default: "termscope=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "termscope=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = match log_file.as_deref() {
        Some(path) => {
            let path = std::path::Path::new(path);
            let dir = path.parent().unwrap_or(std::path::Path::new("."));
            let name = path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("termscope-worker.log");
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            if log_format == "json" {
                registry
                    .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                    .init();
            } else {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(writer)
                            .with_ansi(log_ansi.unwrap_or(false)),
                    )
                    .init();
            }
            Some(guard)
        }
        None => {
            if log_format == "json" {
                registry.with(tracing_subscriber::fmt::layer().json()).init();
            } else {
                let mut layer = tracing_subscriber::fmt::layer();
                if let Some(ansi) = log_ansi {
                    layer = layer.with_ansi(ansi);
                }
                registry.with(layer).init();
            }
            None
        }
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/termscope".to_string());
    let db = Database::connect_with_config(&database_url, PoolConfig::from_env()).await?;

    // Set DATABASE_MIGRATE=false when the schema is managed elsewhere.
    let migrate = std::env::var("DATABASE_MIGRATE")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);
    if migrate {
        info!("Running database migrations...");
        db.migrate().await?;
        info!("Database migrations complete");
    }

    let metrics_pool = db.pool.clone();
    let metrics = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POOL_METRICS_INTERVAL);
        loop {
            ticker.tick().await;
            log_pool_metrics(&metrics_pool);
        }
    });

    let embedder = OllamaEmbedder::from_env()?;
    info!(
        model = embedder.model_name(),
        dimension = embedder.dimension(),
        "Embedding backend configured"
    );

    let worker = EmbeddingBackfillWorker::new(
        Arc::new(db.terminology.clone()),
        Arc::new(embedder),
        BackfillConfig::from_env(),
    );
    let mut events = worker.events();
    let handle = worker.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    if let Err(e) = handle.shutdown().await {
        // The loop already exited (disabled worker).
        warn!(error = %e, "Worker was not running");
        metrics.abort();
        db.pool.close().await;
        return Ok(());
    }

    let stopped = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Ok(event) = events.recv().await {
            if event == BackfillEvent::WorkerStopped {
                break;
            }
        }
    })
    .await;
    if stopped.is_err() {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Worker did not stop within the grace period"
        );
    }

    metrics.abort();
    log_pool_metrics(&db.pool);
    db.pool.close().await;
    info!("termscope-worker stopped");
    Ok(())
}
