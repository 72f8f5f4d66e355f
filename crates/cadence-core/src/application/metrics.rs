use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide invocation counters
#[derive(Debug, Default)]
pub struct FlowMetrics {
    /// Invocations started
    pub started: AtomicU64,
    /// Invocations that ran every step
    pub completed: AtomicU64,
    /// Invocations that failed
    pub failed: AtomicU64,
    /// Invocations that observed a stop
    pub stopped: AtomicU64,
    /// Invocations currently running
    pub active: AtomicU64,
    /// Async submissions accepted
    pub async_accepted: AtomicU64,
    /// Async submissions rejected by the pending limit
    pub async_rejected: AtomicU64,
    /// Async results discarded because they were cancelled
    pub async_discarded: AtomicU64,
}

impl FlowMetrics {
    /// Record an invocation start
    pub fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed invocation
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a failed invocation
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a stopped invocation
    pub fn record_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record an accepted async submission
    pub fn record_async_accepted(&self) {
        self.async_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejected async submission
    pub fn record_async_rejected(&self) {
        self.async_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a discarded async result
    pub fn record_async_discarded(&self) {
        self.async_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Failures over started invocations
    pub fn error_rate(&self) -> f64 {
        let started = self.started.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        if started == 0 {
            0.0
        } else {
            failed as f64 / started as f64
        }
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stopped: self.stopped.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            async_accepted: self.async_accepted.load(Ordering::Relaxed),
            async_rejected: self.async_rejected.load(Ordering::Relaxed),
            async_discarded: self.async_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`FlowMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Invocations started
    pub started: u64,
    /// Invocations that ran every step
    pub completed: u64,
    /// Invocations that failed
    pub failed: u64,
    /// Invocations that observed a stop
    pub stopped: u64,
    /// Invocations currently running
    pub active: u64,
    /// Async submissions accepted
    pub async_accepted: u64,
    /// Async submissions rejected
    pub async_rejected: u64,
    /// Async results discarded after cancellation
    pub async_discarded: u64,
}
