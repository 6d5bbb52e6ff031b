//! Signaling gateway: authenticated participants join sessions and relay
//! opaque negotiation payloads to each other over a websocket.

pub mod access;
pub mod config;
pub mod directory;
pub mod gateway;
pub mod registry;
pub mod telemetry;
pub mod websocket;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use crate::access::{Access, StaticRoster};
pub use crate::config::{Cli, GatewayConfig};
pub use crate::gateway::{Gateway, GatewayError};

pub struct AppState {
    pub gateway: Gateway,
    metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(gateway: Gateway, metrics: PrometheusHandle) -> Self {
        Self { gateway, metrics }
    }

    fn stats(&self) -> StatsResponse {
        let directory = self.gateway.directory();
        let mut sessions: Vec<SessionStatsEntry> = directory
            .live_sessions()
            .into_iter()
            .map(|registry| SessionStatsEntry {
                session_id: registry.session_id().to_string(),
                participants: registry.len(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        StatsResponse {
            active_sessions: sessions.len(),
            tracked_sessions: directory.tracked(),
            active_participants: sessions.iter().map(|s| s.participants).sum(),
            sessions,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_sessions: usize,
    tracked_sessions: usize,
    active_participants: usize,
    sessions: Vec<SessionStatsEntry>,
}

#[derive(Debug, Serialize)]
struct SessionStatsEntry {
    session_id: String,
    participants: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket::ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves the gateway on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}

pub async fn run(config: GatewayConfig, metrics: PrometheusHandle) -> Result<()> {
    let access = config.load_access()?;
    let gateway = Gateway::new(access);
    let sweeper = gateway.directory().spawn_sweeper(config.sweep_interval);
    let state = Arc::new(AppState::new(gateway, metrics));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("flare-gateway listening on {}", config.listen_addr);

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    sweeper.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.metrics.render();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
