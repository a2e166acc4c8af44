//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{debug, info};

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// If another recorder is already installed (a second service in the same
/// process), the returned handle renders a detached, empty registry.
pub fn install_recorder() -> PrometheusHandle {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    match metrics::set_global_recorder(recorder) {
        Ok(()) => info!("prometheus metrics recorder installed"),
        Err(_) => debug!("metrics recorder already installed, using detached handle"),
    }
    handle
}

// Metric name constants shared with the runtime crates.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket disconnections total (counter, label: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Decode tasks run (counter).
pub const DECODE_TASKS_TOTAL: &str = "decode_tasks_total";
/// Decode tasks that failed (counter).
pub const DECODE_ERRORS_TOTAL: &str = "decode_errors_total";
/// Time spent decoding one chunk (histogram).
pub const DECODE_DURATION_SECONDS: &str = "decode_duration_seconds";
/// Tasks waiting for a decode worker (gauge).
pub const DECODE_QUEUE_DEPTH: &str = "decode_queue_depth";
/// Engines currently leased (gauge).
pub const ENGINES_CHECKED_OUT: &str = "engines_checked_out";
/// Queued tasks dropped at executor shutdown (counter).
pub const TASKS_DISCARDED_TOTAL: &str = "tasks_discarded_total";
/// Sessions not yet closed (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
