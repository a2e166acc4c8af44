//! Fixed-size pool of engine instances.
//!
//! The pool is created once at startup. A decode worker checks an engine
//! out for one chunk and the [`EngineLease`] checks it back in when dropped,
//! on every exit path including errors and unwinding panics.
//!
//! The number of leases alive at any instant never exceeds the capacity;
//! `peak_checked_out` records the high-water mark so tests can assert it.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use scribe_core::AudioChunk;

use crate::engine::{AsrEngine, EngineFactory};
use crate::types::{DecodeContext, DecodeOutput, EngineError};

struct Slot {
    index: usize,
    engine: Box<dyn AsrEngine>,
}

struct PoolInner {
    idle: Mutex<Vec<Slot>>,
    available: Condvar,
    capacity: usize,
    checked_out: AtomicUsize,
    peak: AtomicUsize,
}

impl PoolInner {
    fn lease(self: &Arc<Self>, slot: Slot) -> EngineLease {
        let now = self.checked_out.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.peak.fetch_max(now, Ordering::AcqRel);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("engines_checked_out").set(now as f64);
        debug!(engine = slot.index, checked_out = now, "engine checked out");
        EngineLease {
            index: slot.index,
            engine: slot.engine,
            pool: Arc::clone(self),
        }
    }

    fn check_in(&self, slot: Slot) {
        let index = slot.index;
        let now = {
            let mut idle = self.idle.lock();
            let now = self.checked_out.fetch_sub(1, Ordering::AcqRel) - 1;
            idle.push(slot);
            now
        };
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("engines_checked_out").set(now as f64);
        debug!(engine = index, checked_out = now, "engine checked in");
        let _ = self.available.notify_one();
    }
}

/// Shared handle to the engine pool. Cloning is cheap.
#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePool")
            .field("capacity", &self.inner.capacity)
            .field("checked_out", &self.checked_out())
            .finish_non_exhaustive()
    }
}

impl EnginePool {
    /// Create `size` engines sequentially through `factory`.
    ///
    /// The first failure aborts initialization and is returned unchanged.
    pub fn initialize(size: usize, factory: &dyn EngineFactory) -> Result<Self, EngineError> {
        if size == 0 {
            return Err(EngineError::Unsupported(
                "engine pool size must be at least 1".into(),
            ));
        }
        let mut idle = Vec::with_capacity(size);
        for index in 0..size {
            let engine = factory.create(index)?;
            debug!(engine = index, "engine created");
            idle.push(Slot { index, engine });
        }
        // Checkout pops from the back; keep index 0 first out.
        idle.reverse();
        info!(engines = size, "engine pool ready");
        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(idle),
                available: Condvar::new(),
                capacity: size,
                checked_out: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        })
    }

    /// Block until an engine is idle and lease it.
    pub fn checkout(&self) -> EngineLease {
        let mut idle = self.inner.idle.lock();
        loop {
            if let Some(slot) = idle.pop() {
                drop(idle);
                return self.inner.lease(slot);
            }
            self.inner.available.wait(&mut idle);
        }
    }

    /// Lease an idle engine without blocking.
    pub fn try_checkout(&self) -> Option<EngineLease> {
        let slot = self.inner.idle.lock().pop()?;
        Some(self.inner.lease(slot))
    }

    /// Number of engine instances.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Engines currently leased.
    pub fn checked_out(&self) -> usize {
        self.inner.checked_out.load(Ordering::Acquire)
    }

    /// Highest number of engines leased at the same time.
    pub fn peak_checked_out(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }
}

/// Exclusive use of one engine. Checked back in on drop.
pub struct EngineLease {
    index: usize,
    engine: Box<dyn AsrEngine>,
    pool: Arc<PoolInner>,
}

impl EngineLease {
    /// Pool slot of the leased engine.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Debug for EngineLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLease")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Deref for EngineLease {
    type Target = dyn AsrEngine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref()
    }
}

impl DerefMut for EngineLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.engine.as_mut()
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        let engine = std::mem::replace(&mut self.engine, Box::new(Vacant));
        self.pool.check_in(Slot {
            index: self.index,
            engine,
        });
    }
}

/// Placeholder left in a lease while its engine goes back to the pool.
struct Vacant;

impl AsrEngine for Vacant {
    fn decode(
        &mut self,
        _ctx: &mut DecodeContext,
        _chunk: &AudioChunk,
    ) -> Result<DecodeOutput, EngineError> {
        Err(EngineError::Unsupported("engine already checked in".into()))
    }
}
