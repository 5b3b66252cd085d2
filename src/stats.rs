//! Collector-wide statistics (§4.13 / A3), in the shape of the teacher's
//! `util::statistics` counters but trimmed to what the controller's
//! heuristic (§4.10) and the public `num()` API (§6) actually need.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A point-in-time snapshot returned by [`crate::Collector::num`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub gc_num: u64,
    pub quick_sweeps: u64,
    pub full_sweeps: u64,
    pub bytes_allocated: u64,
    pub bytes_freed: u64,
    pub live_bytes: i64,
    pub last_reclaim_ratio: f64,
}

/// Live, mutable counters updated throughout a cycle. All fields are
/// plain atomics rather than a single mutex-guarded struct: each is
/// updated by at most the collector thread during a stop-the-world
/// phase, or by a single mutator on its own allocation path, matching
/// the single-writer discipline described in §5.
#[derive(Default)]
pub struct Stats {
    pub gc_num: AtomicU64,
    pub quick_sweeps: AtomicU64,
    pub full_sweeps: AtomicU64,
    pub bytes_allocated: AtomicU64,
    pub bytes_freed: AtomicU64,
    pub live_bytes: std::sync::atomic::AtomicI64,
    pub bytes_allocated_since_last_cycle: AtomicUsize,
    pub bytes_freed_last_cycle: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_alloc(&self, size: usize) {
        self.bytes_allocated.fetch_add(size as u64, Ordering::Relaxed);
        self.bytes_allocated_since_last_cycle
            .fetch_add(size, Ordering::Relaxed);
        self.live_bytes.fetch_add(size as i64, Ordering::Relaxed);
    }

    pub fn record_free(&self, size: usize) {
        self.bytes_freed.fetch_add(size as u64, Ordering::Relaxed);
        self.bytes_freed_last_cycle
            .fetch_add(size as u64, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size as i64, Ordering::Relaxed);
    }

    /// Reclaim ratio since the last cycle: freed bytes divided by the
    /// bytes allocated since that cycle. Used by the heuristic in §4.10
    /// step 7 to decide whether to double the interval.
    pub fn reclaim_ratio(&self) -> f64 {
        let allocated = self.bytes_allocated_since_last_cycle.load(Ordering::Relaxed);
        if allocated == 0 {
            return 1.0;
        }
        let freed = self.bytes_freed_last_cycle.load(Ordering::Relaxed);
        freed as f64 / allocated as f64
    }

    /// §4.10 step 1: combine per-thread counters into the global cycle
    /// count. The quick/full split isn't known yet at this point (that's
    /// decided in step 7), so it is recorded separately via
    /// [`Stats::record_sweep_kind`].
    pub fn begin_cycle(&self) {
        self.gc_num.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep_kind(&self, full: bool) {
        if full {
            self.full_sweeps.fetch_add(1, Ordering::Relaxed);
        } else {
            self.quick_sweeps.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn end_cycle(&self) {
        self.bytes_allocated_since_last_cycle
            .store(0, Ordering::Relaxed);
        self.bytes_freed_last_cycle.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GcStats {
        GcStats {
            gc_num: self.gc_num.load(Ordering::Relaxed),
            quick_sweeps: self.quick_sweeps.load(Ordering::Relaxed),
            full_sweeps: self.full_sweeps.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            last_reclaim_ratio: self.reclaim_ratio(),
        }
    }
}
