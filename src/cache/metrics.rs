//! Cache Metrics Collection
//!
//! Counters accumulated by the manager plus the [`CacheStats`] snapshot
//! handed to callers and the metrics exporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Lookups
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,

    // Writes
    puts: AtomicU64,
    put_failures: AtomicU64,

    // Evictions reported by the memory tiers' listeners
    memory_evictions: AtomicU64,

    // Prefetch outcomes
    prefetch_succeeded: AtomicU64,
    prefetch_failed: AtomicU64,

    // Maintenance
    cleanup_runs: AtomicU64,
    cleanup_removed: AtomicU64,

    // Disk read latency (microseconds, exponential moving average)
    l2_read_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_l1_hit(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_hit(&self) {
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put_failure(&self) {
        self.put_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_eviction(&self) {
        self.memory_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch(&self, succeeded: u64, failed: u64) {
        self.prefetch_succeeded.fetch_add(succeeded, Ordering::Relaxed);
        self.prefetch_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn record_cleanup(&self, removed: u64) {
        self.cleanup_runs.fetch_add(1, Ordering::Relaxed);
        self.cleanup_removed.fetch_add(removed, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.l1_hits.load(Ordering::Relaxed) + self.l2_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hits over all lookups; 0 before the first lookup
    pub fn hit_rate(&self) -> f64 {
        hit_rate(self.hits(), self.misses())
    }

    pub fn record_l2_read_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = self.l2_read_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .l2_read_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn l2_read_latency(&self) -> Duration {
        Duration::from_micros(self.l2_read_latency_us.load(Ordering::Relaxed))
    }

    /// Combine the counters with the tiers' instantaneous sizes
    pub fn snapshot(&self, sizes: TierSizes) -> CacheStats {
        let hits = self.hits();
        let misses = self.misses();

        CacheStats {
            hits,
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            misses,
            hit_rate: hit_rate(hits, misses),
            promotions: self.promotions.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            put_failures: self.put_failures.load(Ordering::Relaxed),
            evictions: self.memory_evictions.load(Ordering::Relaxed) + sizes.disk_evictions,
            disk_healed: sizes.disk_healed,
            prefetch_succeeded: self.prefetch_succeeded.load(Ordering::Relaxed),
            prefetch_failed: self.prefetch_failed.load(Ordering::Relaxed),
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            cleanup_removed: self.cleanup_removed.load(Ordering::Relaxed),
            l2_read_latency: self.l2_read_latency(),
            memory_entries: sizes.memory_entries,
            memory_capacity: sizes.memory_capacity,
            bitmap_bytes: sizes.bitmap_bytes,
            bitmap_capacity: sizes.bitmap_capacity,
            disk_bytes: sizes.disk_bytes,
            disk_capacity: sizes.disk_capacity,
        }
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Instantaneous tier sizes sampled when a snapshot is taken
#[derive(Debug, Clone, Copy, Default)]
pub struct TierSizes {
    pub memory_entries: u64,
    pub memory_capacity: u64,
    pub bitmap_bytes: u64,
    pub bitmap_capacity: u64,
    pub disk_bytes: u64,
    pub disk_capacity: u64,
    pub disk_evictions: u64,
    pub disk_healed: u64,
}

/// Aggregate cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub promotions: u64,
    pub puts: u64,
    pub put_failures: u64,
    pub evictions: u64,
    /// Corrupted or unreadable disk entries deleted
    pub disk_healed: u64,
    pub prefetch_succeeded: u64,
    pub prefetch_failed: u64,
    pub cleanup_runs: u64,
    pub cleanup_removed: u64,
    #[serde(serialize_with = "serialize_micros")]
    pub l2_read_latency: Duration,

    pub memory_entries: u64,
    pub memory_capacity: u64,
    pub bitmap_bytes: u64,
    pub bitmap_capacity: u64,
    pub disk_bytes: u64,
    pub disk_capacity: u64,
}

fn serialize_micros<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_micros() as u64)
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
