use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing how a stage disposed of its deliveries.
#[derive(Default)]
pub struct StageMetrics {
    acked: AtomicU64,
    degraded: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
}

impl StageMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acknowledged delivery; `degraded` marks fallback or partial handling.
    pub fn record_ack(&self, degraded: bool) {
        self.acked.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a delivery returned to its queue for another attempt.
    pub fn record_requeue(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivery routed to the dead-letter queue.
    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            acked: self.acked.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of stage counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Deliveries acknowledged, including degraded ones.
    pub acked: u64,
    /// Acknowledged deliveries that were handled with a fallback or partial result.
    pub degraded: u64,
    /// Deliveries nacked with requeue.
    pub requeued: u64,
    /// Deliveries nacked to the dead-letter queue.
    pub dead_lettered: u64,
}
