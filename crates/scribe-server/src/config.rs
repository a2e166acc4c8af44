//! Per-connection server configuration.

use std::time::Duration;

use scribe_settings::{MAX_CHUNK_MS, MIN_CHUNK_MS, ScribeSettings};
use serde::{Deserialize, Serialize};

/// Settings the WebSocket handlers read on every connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval between server Ping frames, in seconds.
    pub ping_interval_secs: u64,
    /// PCM sample rate clients stream at.
    pub sample_rate: u32,
    /// Default chunk length in milliseconds.
    pub chunk_ms: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ScribeSettings::default())
    }
}

impl ServerConfig {
    /// Project the connection-facing part of validated settings.
    pub fn from_settings(settings: &ScribeSettings) -> Self {
        Self {
            max_message_size: settings.server.max_message_size,
            ping_interval_secs: settings.server.ping_interval_secs,
            sample_rate: settings.stream.sample_rate,
            chunk_ms: settings.stream.chunk_ms,
        }
    }

    /// Ping interval as a `Duration` (never zero).
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    /// Silence after which a client counts as gone: two ping intervals.
    pub fn idle_timeout(&self) -> Duration {
        self.ping_interval() * 2
    }

    /// Whether a client-requested chunk length is acceptable.
    pub fn accepts_chunk_ms(chunk_ms: u32) -> bool {
        (MIN_CHUNK_MS..=MAX_CHUNK_MS).contains(&chunk_ms)
    }
}
