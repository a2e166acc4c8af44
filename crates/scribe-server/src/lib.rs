//! # scribe-server
//!
//! Axum WebSocket front end and service orchestration.
//!
//! - Streaming endpoint on `/` and `/ws`: PCM16 binary frames in,
//!   `type`-tagged JSON results out
//! - `/health` and Prometheus `/metrics`
//! - [`AsrService`]: ordered startup (settings, engines, decode pool,
//!   listener), the I/O runtime, and reverse-order graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use service::{AsrService, ServiceError};
pub use shutdown::ShutdownCoordinator;
