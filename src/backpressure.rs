//! Drain signalling for bounded parallelism.
//!
//! Writes are never rejected for capacity. Instead, once the number of chunks
//! held by an engine (processing + ready) reaches `max_parallel`, writers are
//! handed a drain [`Signal`] that resolves when the count falls below the
//! limit again. At most one drain is outstanding at any time.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::signal::{Resolvable, Signal};

/// Threshold-based drain controller shared by an engine and its queue.
pub struct Backpressure {
    /// Number of held chunks at which writers are asked to wait
    max_parallel: usize,
    /// The outstanding drain, if backpressure is active
    drain: Mutex<Option<Resolvable>>,
}

impl Backpressure {
    /// Create a controller for the given limit
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel,
            drain: Mutex::new(None),
        }
    }

    /// Check a write that brought the held count to `len`.
    ///
    /// Returns the outstanding drain if there is one, or creates it when the
    /// limit is reached. Returns `None` while below the limit.
    pub fn admit(&self, len: usize) -> Option<Signal> {
        let mut drain = self.lock();

        if let Some(pending) = drain.as_ref() {
            return Some(pending.signal());
        }

        if len >= self.max_parallel {
            let pending = Resolvable::new();
            let signal = pending.signal();
            *drain = Some(pending);
            Some(signal)
        } else {
            None
        }
    }

    /// Resolve and clear the outstanding drain once `len` is below the limit.
    pub fn release(&self, len: usize) {
        if len >= self.max_parallel {
            return;
        }

        if let Some(pending) = self.lock().take() {
            pending.resolve();
        }
    }

    /// Whether writers are currently asked to wait
    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Resolvable>> {
        self.drain.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Backpressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backpressure")
            .field("max_parallel", &self.max_parallel)
            .field("active", &self.is_active())
            .finish()
    }
}
