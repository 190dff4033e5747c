//! underwrite-api server binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use underwrite_api::{router, AppState};
use underwrite_db::{log_pool_metrics, Database, FilesystemBlobStore, MemoryDocumentStore};
use underwrite_jobs::defaults::SERVER_PORT;
use underwrite_jobs::{
    DocumentStore, ExtractionConfig, ExtractionWorker, MatchConfig, Pipeline, QueueConfig,
    WorkerConfig, WorkerEvent,
};
use underwrite_oracle::{HttpOracle, PdfTextProbe};

const DEFAULT_BLOB_ROOT: &str = "./data/blobs";
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "underwrite_api=debug,underwrite_jobs=info,underwrite_oracle=info,tower_http=info".into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("underwrite-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(SERVER_PORT);
    let blob_root = std::env::var("BLOB_ROOT").unwrap_or_else(|_| DEFAULT_BLOB_ROOT.to_string());

    let extraction = ExtractionConfig::from_env()?;
    let queue = QueueConfig::from_env()?;
    let matching = MatchConfig::from_env()?;

    let store: Arc<dyn DocumentStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let db = Database::connect(&url).await?;
            db.migrate().await?;
            log_pool_metrics(db.pool());
            info!(subsystem = "api", "Connected to PostgreSQL document store");
            Arc::new(db.documents.clone())
        }
        Err(_) => {
            warn!(
                subsystem = "api",
                "DATABASE_URL not set, using in-memory document store (state is lost on restart)"
            );
            Arc::new(MemoryDocumentStore::new())
        }
    };

    let oracle = HttpOracle::from_env().with_timeout(extraction.oracle_timeout);
    info!(subsystem = "api", blob_root = %blob_root, "Blob store configured");

    let pipeline = Pipeline::builder()
        .store(store)
        .blobs(Arc::new(FilesystemBlobStore::new(blob_root)))
        .oracle(Arc::new(oracle))
        .probe(Arc::new(PdfTextProbe::new()))
        .extraction_config(extraction)
        .queue_config(queue)
        .match_config(matching)
        .build()?;

    pipeline.recover().await?;

    let worker = ExtractionWorker::new(pipeline.clone(), WorkerConfig::from_env()).start();

    let app = router(AppState::new(pipeline));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped, draining extraction worker");
    let mut events = worker.events();
    match worker.shutdown().await {
        Ok(()) => {
            let drained = tokio::time::timeout(WORKER_DRAIN_TIMEOUT, async {
                while let Ok(event) = events.recv().await {
                    if event == WorkerEvent::WorkerStopped {
                        break;
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!("Extraction worker did not stop in time, abandoning in-flight runs");
            }
        }
        Err(e) => warn!(error = %e, "Extraction worker already stopped"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
