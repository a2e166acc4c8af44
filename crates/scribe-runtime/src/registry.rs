//! Live-session registry.
//!
//! A connection is counted from the moment its upgrade is accepted
//! ([`SessionRegistry::admit`]) until its session is removed, so
//! [`SessionRegistry::wait_empty`] cannot resolve while an upgraded
//! connection is still on its way to registering.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics::gauge;
use parking_lot::RwLock;
use scribe_core::SessionId;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::session::{DrainReason, Session};

#[derive(Default)]
struct Entries {
    sessions: HashMap<SessionId, Arc<Session>>,
    admitting: usize,
}

/// Thread-safe map of every session that has not finished closing.
pub struct SessionRegistry {
    entries: RwLock<Entries>,
    live: watch::Sender<usize>,
    draining: AtomicBool,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("live", &self.len())
            .field("draining", &self.draining.load(Ordering::Acquire))
            .finish()
    }
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        let (live, _) = watch::channel(0);
        Self {
            entries: RwLock::new(Entries::default()),
            live,
            draining: AtomicBool::new(false),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish(&self, entries: &Entries) {
        let _ = self
            .live
            .send_replace(entries.sessions.len() + entries.admitting);
        gauge!("sessions_active").set(entries.sessions.len() as f64);
    }

    /// Count a connection whose session is not registered yet.
    ///
    /// The slot is released by [`Admission::register`] or by dropping the
    /// admission (a failed upgrade).
    pub fn admit(self: &Arc<Self>) -> Admission {
        let mut entries = self.entries.write();
        entries.admitting += 1;
        self.publish(&entries);
        Admission {
            registry: Some(Arc::clone(self)),
        }
    }

    fn register(&self, session: Arc<Session>) {
        let late = {
            let mut entries = self.entries.write();
            entries.admitting = entries.admitting.saturating_sub(1);
            let _ = entries.sessions.insert(session.id().clone(), Arc::clone(&session));
            self.publish(&entries);
            self.draining.load(Ordering::Acquire)
        };
        if late {
            debug!(session_id = %session.id(), "session registered during drain");
            session.signal_shutdown();
        }
    }

    fn withdraw(&self) {
        let mut entries = self.entries.write();
        entries.admitting = entries.admitting.saturating_sub(1);
        self.publish(&entries);
    }

    /// Stop tracking a session.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let mut entries = self.entries.write();
        let removed = entries.sessions.remove(id);
        self.publish(&entries);
        removed
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.entries.read().sessions.len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask every live session to drain, including sessions that register
    /// from now on. Returns how many were signalled.
    pub fn begin_drain_all(&self) -> usize {
        self.draining.store(true, Ordering::Release);
        let sessions: Vec<Arc<Session>> = self.entries.read().sessions.values().cloned().collect();
        for session in &sessions {
            let _ = session.begin_drain(DrainReason::ServerShutdown);
            session.signal_shutdown();
        }
        if !sessions.is_empty() {
            info!(sessions = sessions.len(), "draining live sessions");
        }
        sessions.len()
    }

    /// Resolve once every session has been removed and no admission is
    /// outstanding.
    pub async fn wait_empty(&self) {
        let mut rx = self.live.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// A connection counted by the registry before its session exists.
#[must_use = "dropping an admission releases its slot"]
pub struct Admission {
    registry: Option<Arc<SessionRegistry>>,
}

impl Admission {
    /// Register `session` in the slot held by this admission.
    pub fn register(mut self, session: Arc<Session>) {
        if let Some(registry) = self.registry.take() {
            registry.register(session);
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("pending", &self.registry.is_some())
            .finish()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.withdraw();
        }
    }
}
