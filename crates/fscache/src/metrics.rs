//! Dispatcher counters.
//!
//! One [`Metrics`] per dispatcher, shared through an `Arc` with the endpoint
//! tasks. Lock-free atomics; readers take a [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    // Scheduling
    pub ticks: AtomicU64,
    pub workers_launched: AtomicU64,
    pub fires_skipped: AtomicU64,
    pub worker_crashes: AtomicU64,

    // cache-query endpoint
    pub lookups: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,

    // worker-result endpoint
    pub results_merged: AtomicU64,
    pub entries_merged: AtomicU64,
    pub empty_results: AtomicU64,
    pub precondition_failures: AtomicU64,
    pub malformed_results: AtomicU64,

    // Connection layer
    pub protocol_errors: AtomicU64,
}

macro_rules! counters {
    ($($inc:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $inc(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    counters! {
        inc_ticks => ticks,
        inc_workers_launched => workers_launched,
        inc_fires_skipped => fires_skipped,
        inc_worker_crashes => worker_crashes,
        inc_lookups => lookups,
        inc_hits => hits,
        inc_misses => misses,
        inc_results_merged => results_merged,
        inc_empty_results => empty_results,
        inc_precondition_failures => precondition_failures,
        inc_malformed_results => malformed_results,
        inc_protocol_errors => protocol_errors,
    }

    #[inline]
    pub fn add_entries_merged(&self, count: usize) {
        self.entries_merged.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            ticks: load(&self.ticks),
            workers_launched: load(&self.workers_launched),
            fires_skipped: load(&self.fires_skipped),
            worker_crashes: load(&self.worker_crashes),
            lookups: load(&self.lookups),
            hits: load(&self.hits),
            misses: load(&self.misses),
            results_merged: load(&self.results_merged),
            entries_merged: load(&self.entries_merged),
            empty_results: load(&self.empty_results),
            precondition_failures: load(&self.precondition_failures),
            malformed_results: load(&self.malformed_results),
            protocol_errors: load(&self.protocol_errors),
        }
    }
}

/// Immutable snapshot of metrics for reading
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub ticks: u64,
    pub workers_launched: u64,
    pub fires_skipped: u64,
    pub worker_crashes: u64,
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub results_merged: u64,
    pub entries_merged: u64,
    pub empty_results: u64,
    pub precondition_failures: u64,
    pub malformed_results: u64,
    pub protocol_errors: u64,
}

impl MetricsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }

    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Ticks: {} | Workers: {} launched, {} skipped, {} crashed | \
             Lookups: {} ({} hits, {:.1}% hit rate) | \
             Results: {} merged ({} entries), {} empty, {} precondition, {} malformed | \
             Protocol errors: {}",
            self.ticks,
            self.workers_launched,
            self.fires_skipped,
            self.worker_crashes,
            self.lookups,
            self.hits,
            self.hit_rate() * 100.0,
            self.results_merged,
            self.entries_merged,
            self.empty_results,
            self.precondition_failures,
            self.malformed_results,
            self.protocol_errors,
        )
    }
}
