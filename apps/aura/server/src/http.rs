use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ws::rejection::WebSocketUpgradeRejection, ConnectInfo, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tracing::warn;

use crate::{
    auth::{authorize, Credentials},
    broker::Broker,
    handler::handle_socket,
    registry::PoolKind,
};

pub struct AppState {
    pub broker: Arc<Broker>,
    pub credentials: Option<Credentials>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/aura/provider", get(provider_ws_handler))
        .route("/aura/client", get(client_ws_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.broker.sizes())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn provider_ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    upgrade(state, PoolKind::Providers, remote_addr, &headers, ws)
}

async fn client_ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    upgrade(state, PoolKind::Clients, remote_addr, &headers, ws)
}

fn upgrade(
    state: Arc<AppState>,
    pool: PoolKind,
    remote_addr: SocketAddr,
    headers: &HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(err) = authorize(headers, state.credentials.as_ref()) {
        counter!(
            "aura_auth_failures_total",
            1,
            "pool" => pool.as_str(),
            "reason" => err.metric_label()
        );
        warn!(pool = %pool, remote_addr = %remote_addr, error = %err, "rejected websocket upgrade");
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"aura\"")],
        )
            .into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let broker = Arc::clone(&state.broker);
    ws.on_upgrade(move |socket| handle_socket(socket, broker, pool, remote_addr))
}
