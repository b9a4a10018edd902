//! Admission counters for observability.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-lifetime counters recorded on every admission decision.
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    allowed: AtomicU64,
    rejected_burst: AtomicU64,
    rejected_window: AtomicU64,
}

impl AdmissionMetrics {
    pub(crate) fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected_burst(&self) {
        self.rejected_burst.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected_window(&self) {
        self.rejected_window.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.allowed.store(0, Ordering::Relaxed);
        self.rejected_burst.store(0, Ordering::Relaxed);
        self.rejected_window.store(0, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected_burst: self.rejected_burst.load(Ordering::Relaxed),
            rejected_window: self.rejected_window.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of the admission counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests admitted through both guards.
    pub allowed: u64,
    /// Requests turned away by the burst bucket.
    pub rejected_burst: u64,
    /// Requests turned away by the sliding-window quota.
    pub rejected_window: u64,
}

impl MetricsSnapshot {
    /// Total rejected requests across both guards.
    pub fn rejected(&self) -> u64 {
        self.rejected_burst + self.rejected_window
    }
}
