//! Process-wide counters for the batching layer.
//!
//! Counters are plain relaxed atomics: cheap enough to bump on every
//! request, and readable from any thread without coordination.
//!
//! ```ignore
//! use ledgerbft_batch::instrumentation::METRICS;
//!
//! METRICS.increment_batches_cut(batch.len());
//! let snapshot = METRICS.snapshot();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

/// Batching-layer counters.
#[derive(Debug)]
pub struct Metrics {
    // === Admission ===
    /// Requests accepted into the request store
    requests_admitted_total: AtomicU64,
    /// Requests rejected as already executed
    requests_stale_total: AtomicU64,

    // === Batching ===
    /// Batches cut on this replica
    batches_cut_total: AtomicU64,
    /// Requests placed into cut batches
    requests_batched_total: AtomicU64,
    /// Cut attempts on an empty buffer
    empty_cuts_total: AtomicU64,

    // === Execution ===
    /// Executed requests the store did not know about
    untracked_executions_total: AtomicU64,

    // === Lifecycle ===
    view_changes_total: AtomicU64,
    state_updates_total: AtomicU64,
    /// Request timer expiries that suspected the primary
    request_timeouts_total: AtomicU64,

    // === Network ===
    /// Unicasts that failed after every attempt
    broadcast_failures_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a zeroed instance. Const for static initialization.
    pub const fn new() -> Self {
        Self {
            requests_admitted_total: AtomicU64::new(0),
            requests_stale_total: AtomicU64::new(0),
            batches_cut_total: AtomicU64::new(0),
            requests_batched_total: AtomicU64::new(0),
            empty_cuts_total: AtomicU64::new(0),
            untracked_executions_total: AtomicU64::new(0),
            view_changes_total: AtomicU64::new(0),
            state_updates_total: AtomicU64::new(0),
            request_timeouts_total: AtomicU64::new(0),
            broadcast_failures_total: AtomicU64::new(0),
        }
    }

    pub fn increment_requests_admitted(&self) {
        self.requests_admitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_requests_stale(&self) {
        self.requests_stale_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one cut batch of `size` requests.
    pub fn increment_batches_cut(&self, size: usize) {
        self.batches_cut_total.fetch_add(1, Ordering::Relaxed);
        self.requests_batched_total
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn increment_empty_cuts(&self) {
        self.empty_cuts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_untracked_executions(&self) {
        self.untracked_executions_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_view_changes(&self) {
        self.view_changes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_state_updates(&self) {
        self.state_updates_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_request_timeouts(&self) {
        self.request_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_broadcast_failures(&self) {
        self.broadcast_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Exports counters in Prometheus exposition format.
    pub fn export_prometheus(&self) -> String {
        use std::fmt::Write;

        let snapshot = self.snapshot();
        let counters = [
            ("requests_admitted_total", "Requests admitted", snapshot.requests_admitted_total),
            ("requests_stale_total", "Stale requests rejected", snapshot.requests_stale_total),
            ("batches_cut_total", "Batches cut", snapshot.batches_cut_total),
            ("requests_batched_total", "Requests placed in batches", snapshot.requests_batched_total),
            ("empty_cuts_total", "Cuts attempted on an empty buffer", snapshot.empty_cuts_total),
            ("untracked_executions_total", "Executed requests missing from the store", snapshot.untracked_executions_total),
            ("view_changes_total", "View changes observed", snapshot.view_changes_total),
            ("state_updates_total", "State transfers completed", snapshot.state_updates_total),
            ("request_timeouts_total", "Request timer expiries", snapshot.request_timeouts_total),
            ("broadcast_failures_total", "Failed unicasts", snapshot.broadcast_failures_total),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            let _ = write!(
                output,
                "# HELP ledgerbft_{name} {help}\n\
                 # TYPE ledgerbft_{name} counter\n\
                 ledgerbft_{name} {value}\n",
            );
        }
        output
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_admitted_total: self.requests_admitted_total.load(Ordering::Relaxed),
            requests_stale_total: self.requests_stale_total.load(Ordering::Relaxed),
            batches_cut_total: self.batches_cut_total.load(Ordering::Relaxed),
            requests_batched_total: self.requests_batched_total.load(Ordering::Relaxed),
            empty_cuts_total: self.empty_cuts_total.load(Ordering::Relaxed),
            untracked_executions_total: self.untracked_executions_total.load(Ordering::Relaxed),
            view_changes_total: self.view_changes_total.load(Ordering::Relaxed),
            state_updates_total: self.state_updates_total.load(Ordering::Relaxed),
            request_timeouts_total: self.request_timeouts_total.load(Ordering::Relaxed),
            broadcast_failures_total: self.broadcast_failures_total.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub requests_admitted_total: u64,
    pub requests_stale_total: u64,
    pub batches_cut_total: u64,
    pub requests_batched_total: u64,
    pub empty_cuts_total: u64,
    pub untracked_executions_total: u64,
    pub view_changes_total: u64,
    pub state_updates_total: u64,
    pub request_timeouts_total: u64,
    pub broadcast_failures_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    // METRICS is shared with every test in the crate; use private instances.

    #[test]
    fn batch_cut_counts_requests() {
        let metrics = Metrics::new();
        metrics.increment_batches_cut(3);
        metrics.increment_batches_cut(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches_cut_total, 2);
        assert_eq!(snapshot.requests_batched_total, 5);
    }

    #[test]
    fn prometheus_export_lists_every_counter() {
        let metrics = Metrics::new();
        metrics.increment_requests_stale();
        metrics.increment_view_changes();

        let output = metrics.export_prometheus();
        assert!(output.contains("# TYPE ledgerbft_requests_stale_total counter"));
        assert!(output.contains("ledgerbft_requests_stale_total 1"));
        assert!(output.contains("ledgerbft_view_changes_total 1"));
        assert_eq!(output.matches("# HELP").count(), 10);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let metrics = std::sync::Arc::new(Metrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = std::sync::Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.increment_requests_admitted();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(metrics.snapshot().requests_admitted_total, 4000);
    }

    #[test]
    fn global_instance_only_grows() {
        let before = METRICS.snapshot().untracked_executions_total;
        METRICS.increment_untracked_executions();
        assert!(METRICS.snapshot().untracked_executions_total > before);
    }
}
