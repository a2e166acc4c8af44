//! Per-client connection state shared by the reader and writer halves.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use scribe_core::SessionId;

/// One connected streaming client.
#[derive(Debug)]
pub struct ClientConnection {
    session_id: SessionId,
    wav_name: Mutex<String>,
    last_seen: Mutex<Instant>,
    connected_at: Instant,
}

impl ClientConnection {
    /// New connection bound to `session_id`.
    pub fn new(session_id: SessionId) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            wav_name: Mutex::new(String::new()),
            last_seen: Mutex::new(now),
            connected_at: now,
        }
    }

    /// Bound session.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Name echoed back in results (empty until the client sets one).
    pub fn wav_name(&self) -> String {
        self.wav_name.lock().clone()
    }

    /// Replace the echoed name.
    pub fn set_wav_name(&self, name: String) {
        *self.wav_name.lock() = name;
    }

    /// Record client activity (any frame).
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the client last sent anything.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
