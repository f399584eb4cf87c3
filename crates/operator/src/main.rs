//! PodMonitor operator
//!
//! Drives PodMonitor resources from creation to completion: watches the
//! store, reconciles each resource through its phases and serves health and
//! metrics endpoints.

use anyhow::{Context as _, Result};
use clap::Parser;
use podmonitor_lib::{
    controller::{ContextBuilder, Controller},
    health::HealthRegistry,
    store::MemoryStore,
};
use podmonitor_operator::{api, config};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = config::Args::parse();
    let config = config::OperatorConfig::load()?.with_args(&args);
    info!(
        workers = config.workers,
        api_port = config.api_port,
        "Operator configured"
    );

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &config.manifest_path {
        let manifest = config::load_manifest(path)?;
        store.seed(manifest).await;
    }

    let health = HealthRegistry::for_operator().await;
    let ctx = Arc::new(
        ContextBuilder::new()
            .store(store.clone())
            .event_sink(store.clone())
            .health(health.clone())
            .backoff(config.backoff_base(), config.backoff_max())
            .event_dedup_window(config.event_dedup_window())
            .template(config.child_template())
            .reconcile(config.reconcile_config())
            .build()
            .context("Failed to build operator context")?,
    );
    ctx.logger.log_startup(OPERATOR_VERSION, config.workers);

    let (shutdown_tx, _) = broadcast::channel(1);

    let app_state = Arc::new(api::AppState::new(health, ctx.metrics.clone()));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    let controller = Controller::new(ctx.clone(), config.workers);
    let dispatcher_handle = tokio::spawn(
        controller
            .dispatcher()
            .run(store.clone(), shutdown_tx.subscribe()),
    );
    let controller_handle = tokio::spawn(controller.run(shutdown_tx.subscribe()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    ctx.logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());

    match controller_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Controller stopped with error"),
        Err(e) => error!(error = %e, "Controller task panicked"),
    }
    if let Err(e) = dispatcher_handle.await {
        error!(error = %e, "Dispatcher task panicked");
    }
    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }

    info!("Shutdown complete");
    Ok(())
}
