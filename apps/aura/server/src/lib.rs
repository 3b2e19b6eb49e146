//! Aura relay broker.
//!
//! Clients and providers each hold one long-lived websocket. Client requests
//! go to a randomly picked provider tagged with the client's registry tag;
//! provider replies carrying that tag come back to exactly that client.
//! Every change in pool membership is pushed to all clients as
//! `clients`/`providers` counts.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub mod auth;
pub mod broadcast;
pub mod broker;
pub mod config;
pub mod connection;
pub mod handler;
pub mod http;
pub mod registry;
pub mod router;
pub mod telemetry;

use crate::{broker::Broker, config::ServerConfig, http::AppState};

/// Binds the configured address and serves until ctrl-c.
pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("aura relay listening on {}", config.listen_addr);

    serve(listener, config.clone(), metrics, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

/// Serves the relay on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    config: ServerConfig,
    metrics: Option<PrometheusHandle>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if !config.auth_enabled() {
        warn!("no credentials configured; websocket endpoints are open");
    }

    let state = Arc::new(AppState {
        broker: Arc::new(Broker::new(config.broker.clone())),
        credentials: config.credentials.clone(),
        metrics,
    });
    let app = http::router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
