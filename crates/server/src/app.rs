//! Startup wiring and shutdown.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use courier_infra::jobs::{Registry, Runner, SqliteJobStore, UserLookup, register_send_email};
use courier_infra::{AuthStore, Database, EmailSender, LogEmailSender};

use crate::config::Config;

/// Every job handler this process knows how to run.
pub fn build_registry(sender: Arc<dyn EmailSender>, users: Arc<dyn UserLookup>) -> Registry {
    let mut registry = Registry::new();
    register_send_email(&mut registry, sender, users);
    registry
}

/// Connect, migrate and run the job runner until `shutdown` resolves.
pub async fn run(config: Config, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting courier-server");

    if let Some(addr) = config.metrics_addr {
        courier_observability::metrics::install_prometheus(addr)
            .context("error installing Prometheus exporter")?;
        info!(address = %addr, "serving metrics");
    }

    let db = Database::connect(&config.database())
        .await
        .context("error connecting to database")?;
    db.migrate().await.context("error migrating database")?;

    let auth = Arc::new(AuthStore::new(&db));
    let sender = Arc::new(LogEmailSender::new(&config.base_url));
    let registry = Arc::new(build_registry(sender, auth));

    let runner = if config.jobs_enabled {
        let store = Arc::new(SqliteJobStore::new(&db));
        Some(Runner::new(store, registry, config.runner()).spawn())
    } else {
        info!("jobs disabled; not starting the job runner");
        None
    };

    shutdown.await;
    info!("shutting down");

    if let Some(runner) = runner {
        runner.shutdown().await;
    }
    db.close().await;

    info!("shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("shutdown signal received");
    Ok(())
}
