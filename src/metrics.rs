//! Injected metrics sink.
//!
//! The store and dispatch schedulers report through an `Arc<dyn
//! RecordMetrics>` handed to them at build time. There is no process-wide
//! counter state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives counters from the store and the dispatch schedulers.
///
/// Every method defaults to a no-op so sinks only override what they track.
pub trait RecordMetrics: Send + Sync {
    /// A commit carrying `events` events was accepted.
    fn commit_accepted(&self, events: usize) {
        let _ = events;
    }

    /// A commit attempt turned out to be a retry of a stored commit.
    fn commit_duplicate(&self) {}

    /// A commit attempt lost an optimistic concurrency race.
    fn commit_conflict(&self) {}

    /// A commit was published and marked dispatched.
    fn commit_dispatched(&self) {}

    /// Publishing a commit failed; it stays undispatched.
    fn dispatch_failed(&self) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl RecordMetrics for NoopMetrics {}

/// Point-in-time copy of [`CountingMetrics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Accepted commits.
    pub commits: u64,
    /// Events across accepted commits.
    pub events: u64,
    /// Duplicate attempts.
    pub duplicates: u64,
    /// Concurrency conflicts.
    pub conflicts: u64,
    /// Commits published and marked dispatched.
    pub dispatched: u64,
    /// Failed publish attempts.
    pub dispatch_failures: u64,
}

/// Lock-free in-process counters.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    commits: AtomicU64,
    events: AtomicU64,
    duplicates: AtomicU64,
    conflicts: AtomicU64,
    dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
}

impl CountingMetrics {
    /// Fresh counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every counter.
    ///
    /// Counters are read one by one, so a snapshot taken under load may mix
    /// values from slightly different instants.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
        }
    }
}

impl RecordMetrics for CountingMetrics {
    fn commit_accepted(&self, events: usize) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.events.fetch_add(events as u64, Ordering::Relaxed);
    }

    fn commit_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    fn commit_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    fn commit_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn dispatch_failed(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn counting_metrics_accumulates() {
        let metrics = CountingMetrics::new();
        metrics.commit_accepted(3);
        metrics.commit_accepted(1);
        metrics.commit_duplicate();
        metrics.commit_conflict();
        metrics.commit_dispatched();
        metrics.dispatch_failed();

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                commits: 2,
                events: 4,
                duplicates: 1,
                conflicts: 1,
                dispatched: 1,
                dispatch_failures: 1,
            }
        );
    }

    #[test]
    fn noop_metrics_is_usable_as_trait_object() {
        let sink: Arc<dyn RecordMetrics> = Arc::new(NoopMetrics);
        sink.commit_accepted(10);
        sink.dispatch_failed();
    }
}
