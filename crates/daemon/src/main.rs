//! The worker process binary (spec §6.4–§6.5): loads configuration, wires
//! the Postgres-backed stores and handler registry, runs the worker
//! runtime until SIGINT/SIGTERM, then shuts down gracefully.

mod config;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

use config::Config;
use kura_store::PostgresStore;
use kura_worker::WorkerDeps;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fatal: {err}");
            std::process::exit(1);
        }
    };

    kura_observability::init(config.log_format);

    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "kura-daemon exited with an error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new().max_connections(10).connect(&config.database_url).await?;
    let store = Arc::new(PostgresStore::new(pool));

    let registry = kura_handlers::register_all(&config.handlers_config());

    let deps = WorkerDeps {
        events: store.clone(),
        projections: store.clone(),
        inference_runs: store.clone(),
        jobs: store.clone(),
        notify: store.clone(),
        schema_capabilities: store.clone(),
        registry,
        max_retries: config.max_retries,
    };

    tracing::info!(
        batch_size = config.batch_size,
        poll_interval_seconds = config.poll_interval_seconds,
        max_retries = config.max_retries,
        "kura-daemon starting"
    );

    let handle = kura_worker::spawn(deps, config.worker_config());

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining in-flight work");
    handle.shutdown().await;
    tracing::info!("kura-daemon stopped");

    Ok(())
}

/// Waits for SIGINT or, on Unix, SIGTERM (spec §6.5, §5 "Cancellation").
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler");
        signal.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
