//! Tracing hooks.
//!
//! The macros forward to `tracing` when the `tracing` feature is enabled and
//! expand to nothing otherwise, so call sites need no feature gates.

use std::future::Future;

#[cfg(feature = "tracing")]
macro_rules! ifca_trace {
    ($($arg:tt)*) => { ::tracing::trace!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! ifca_trace {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! ifca_debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! ifca_debug {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! ifca_warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! ifca_warn {
    ($($arg:tt)*) => {};
}

/// Attach a per-chunk span to a processing task
#[cfg(feature = "tracing")]
pub(crate) fn instrument<F: Future>(
    future: F,
    stage: &str,
    index: u64,
) -> tracing::instrument::Instrumented<F> {
    use tracing::Instrument;

    future.instrument(tracing::trace_span!("ifca_chunk", stage = %stage, index))
}

#[cfg(not(feature = "tracing"))]
pub(crate) fn instrument<F: Future>(future: F, _stage: &str, _index: u64) -> F {
    future
}
