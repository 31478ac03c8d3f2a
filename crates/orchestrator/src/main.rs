//! Saga worker entry point.

use orchestrator::{Config, OrchestratorError, Worker};
use run_store::{InMemoryRunStore, PostgresRunStore};
use tokio::signal;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), OrchestratorError> {
    // 1. Configuration and tracing
    let config = Config::from_env();
    orchestrator::init_tracing(&config)?;

    // 2. Prometheus exporter
    orchestrator::install_metrics(&config)?;

    // 3. Run store, then sweep until shutdown
    let summary = match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresRunStore::connect(url).await?;
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL run store");
            let worker = Worker::new(store, &config)?;
            worker.run(shutdown_signal()).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, runs are kept in memory and lost on exit");
            let worker = Worker::new(InMemoryRunStore::new(), &config)?;
            worker.run(shutdown_signal()).await
        }
    };

    tracing::info!(
        completed = summary.completed,
        rolled_back = summary.rolled_back,
        compensation_failed = summary.compensation_failed,
        errors = summary.errors,
        "worker shut down gracefully"
    );
    Ok(())
}
