//! Memory-layer telemetry.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;

/// Snapshot published to external reporters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    /// Bytes held by live segments
    pub total_allocated: usize,
    /// Live segments
    pub total_segments: usize,
    /// Plain loads
    pub read_operations: u64,
    /// Stores and read-modify-write operations
    pub write_operations: u64,
    /// Compare-and-swap attempts
    pub cas_operations: u64,
    /// Failed compare-and-swap attempts
    pub contention_count: u64,
    /// Mean operation latency
    pub avg_latency_ns: f64,
    /// Slowest operation observed
    pub peak_latency_ns: u64,
    /// Locks force-released by the watchdog
    pub stale_locks_reclaimed: u64,
}

/// Which counter an operation feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Read,
    Write,
    Cas,
}

/// Lock-free counters behind [`MemoryStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    reads: AtomicU64,
    writes: AtomicU64,
    cas: AtomicU64,
    contention: AtomicU64,
    latency_total_ns: AtomicU64,
    latency_samples: AtomicU64,
    latency_peak_ns: AtomicU64,
    stale_reclaimed: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn record(&self, kind: OpKind, latency: Duration) {
        let counter = match kind {
            OpKind::Read => &self.reads,
            OpKind::Write => &self.writes,
            OpKind::Cas => &self.cas,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.latency_total_ns.fetch_add(ns, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.latency_peak_ns.fetch_max(ns, Ordering::Relaxed);
    }

    pub(crate) fn record_contention(&self) {
        self.contention.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_reclaim(&self) {
        self.stale_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counters only; the caller fills in registry totals.
    pub(crate) fn snapshot(&self) -> MemoryStats {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let total = self.latency_total_ns.load(Ordering::Relaxed);
        MemoryStats {
            total_allocated: 0,
            total_segments: 0,
            read_operations: self.reads.load(Ordering::Relaxed),
            write_operations: self.writes.load(Ordering::Relaxed),
            cas_operations: self.cas.load(Ordering::Relaxed),
            contention_count: self.contention.load(Ordering::Relaxed),
            avg_latency_ns: if samples == 0 { 0.0 } else { total as f64 / samples as f64 },
            peak_latency_ns: self.latency_peak_ns.load(Ordering::Relaxed),
            stale_locks_reclaimed: self.stale_reclaimed.load(Ordering::Relaxed),
        }
    }
}
