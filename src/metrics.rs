//! Per-engine chunk counters.
//!
//! Every engine keeps its own atomic counts, which are also forwarded to the
//! global `metrics` recorder labelled with the engine name.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const WRITTEN: &str = "ifca_chunks_written_total";
const EMITTED: &str = "ifca_chunks_emitted_total";
const DROPPED: &str = "ifca_chunks_dropped_total";
const FAILED: &str = "ifca_chunks_failed_total";

/// Chunk counters for one engine
#[derive(Debug, Clone)]
pub struct StageMetrics {
    stage: String,
    written: Arc<AtomicU64>,
    emitted: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

/// A point-in-time copy of [`StageMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricCounts {
    pub written: u64,
    pub emitted: u64,
    pub dropped: u64,
    pub failed: u64,
}

impl StageMetrics {
    /// Create counters for the named engine
    pub fn new<S: Into<String>>(stage: S) -> Self {
        Self {
            stage: stage.into(),
            written: Arc::new(AtomicU64::new(0)),
            emitted: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record an accepted write
    pub fn record_written(&self) {
        self.record(&self.written, WRITTEN);
    }

    /// Record a chunk settled with a value
    pub fn record_emitted(&self) {
        self.record(&self.emitted, EMITTED);
    }

    /// Record a chunk filtered out or aborted
    pub fn record_dropped(&self) {
        self.record(&self.dropped, DROPPED);
    }

    /// Record a chunk that failed without recovery
    pub fn record_failed(&self) {
        self.record(&self.failed, FAILED);
    }

    /// Get current counts
    pub fn counts(&self) -> MetricCounts {
        MetricCounts {
            written: self.written.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn record(&self, counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!(name, "stage" => self.stage.clone()).increment(1);
    }
}
