//! One-shot resolvable signals.
//!
//! A [`Resolvable`] owns the trigger, while any number of cloned [`Signal`]
//! handles can await it. The engine uses them for drain (backpressure)
//! notification, end-of-stream notification and per-chunk completion.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

/// An awaitable handle to a [`Resolvable`].
///
/// Signals are cheap to clone and every clone completes once the owning
/// resolvable is resolved or dropped.
#[derive(Clone)]
pub struct Signal {
    inner: Shared<BoxFuture<'static, ()>>,
    resolved: Arc<AtomicBool>,
}

impl Signal {
    /// A signal that is already resolved
    pub fn resolved() -> Self {
        Self {
            inner: future::ready(()).boxed().shared(),
            resolved: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the signal has been resolved, without polling it
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }
}

impl Future for Signal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// The trigger side of a [`Signal`].
///
/// Dropping a resolvable resolves it, so waiters never hang on a trigger
/// that went away (for example when a processing task panics).
pub struct Resolvable {
    tx: Option<oneshot::Sender<()>>,
    signal: Signal,
}

impl Resolvable {
    /// Create a new unresolved signal pair
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel::<()>();
        Self {
            tx: Some(tx),
            signal: Signal {
                inner: rx.map(|_| ()).boxed().shared(),
                resolved: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    /// Get an awaitable handle
    pub fn signal(&self) -> Signal {
        self.signal.clone()
    }

    /// Resolve every handle handed out so far (and any handed out later)
    pub fn resolve(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.signal.resolved.store(true, Ordering::Release);
            let _ = tx.send(());
        }
    }
}

impl Default for Resolvable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Resolvable {
    fn drop(&mut self) {
        self.fire();
    }
}

impl fmt::Debug for Resolvable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolvable")
            .field("resolved", &self.signal.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_pending_until_resolved() {
        let resolvable = Resolvable::new();
        let mut first = task::spawn(resolvable.signal());
        let mut second = task::spawn(resolvable.signal());

        assert_pending!(first.poll());
        assert!(!resolvable.signal().is_resolved());

        resolvable.resolve();

        assert!(first.is_woken());
        assert_ready!(first.poll());
        assert_ready!(second.poll());
    }

    #[test]
    fn test_drop_resolves() {
        let resolvable = Resolvable::new();
        let signal = resolvable.signal();
        drop(resolvable);

        assert!(signal.is_resolved());
        let mut waiting = task::spawn(signal);
        assert_ready!(waiting.poll());
    }

    #[test]
    fn test_already_resolved() {
        let mut signal = task::spawn(Signal::resolved());
        assert_ready!(signal.poll());
    }
}
