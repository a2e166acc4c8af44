//! Axum router: the streaming WebSocket endpoint plus health and metrics.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use scribe_engine::EnginePool;
use scribe_runtime::{DecodeQueue, SessionRegistry};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection-facing settings.
    pub config: Arc<ServerConfig>,
    /// Submit handle of the decode executor.
    pub queue: DecodeQueue,
    /// Engine pool shared by every session.
    pub engines: EnginePool,
    /// Live sessions.
    pub registry: Arc<SessionRegistry>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Open WebSocket connections.
    pub connections: Arc<AtomicUsize>,
    /// When the service started.
    pub start_time: Instant,
    /// Prometheus render handle.
    pub metrics: PrometheusHandle,
}

/// Build the Axum router with all routes.
///
/// The streaming endpoint answers on both `/` and `/ws`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// WebSocket upgrade. Refused with 503 once shutdown has begun.
///
/// The connection is admitted to the registry before the shutdown check,
/// so a drain that starts after the check waits for this session.
async fn ws_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let admission = state.registry.admit();
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    match ws {
        Ok(ws) => ws
            .max_message_size(state.config.max_message_size)
            .on_upgrade(move |socket| run_ws_session(socket, state, admission)),
        Err(rejection) => rejection.into_response(),
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connections.load(Ordering::Relaxed),
        state.registry.len(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}
