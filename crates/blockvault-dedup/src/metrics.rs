//! Operation counters for the backup engine.
//!
//! Counters are atomic and lock-free so the block store can update them from
//! any thread without touching the index lock. They reset when the process
//! exits; persistent statistics come from [`crate::store::StoreStats`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Thread-safe counters for store and lifecycle operations.
#[derive(Debug, Default)]
pub struct DedupMetrics {
    /// New unique blocks written to disk.
    blocks_written: AtomicU64,
    /// `put` calls satisfied by an existing block.
    dedup_hits: AtomicU64,
    /// Plaintext bytes passed to `put`.
    logical_bytes_in: AtomicU64,
    /// Stored (compressed and encrypted) bytes written.
    physical_bytes_written: AtomicU64,
    /// AEAD encryptions performed.
    encrypt_ops: AtomicU64,
    /// Blocks read back during restores.
    blocks_restored: AtomicU64,
    /// Plaintext bytes produced by restores.
    bytes_restored: AtomicU64,
    /// Garbage collection runs completed.
    gc_runs: AtomicU64,
    /// Bytes freed by garbage collection.
    gc_bytes_freed: AtomicU64,
    /// Blocks classified corrupted or missing by scrubs.
    scrub_failures: AtomicU64,
}

impl DedupMetrics {
    /// Create a set of counters initialised to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly stored block.
    #[inline]
    pub fn record_block_written(&self, logical: u64, physical: u64, encrypted: bool) {
        self.blocks_written.fetch_add(1, Ordering::Relaxed);
        self.logical_bytes_in.fetch_add(logical, Ordering::Relaxed);
        self.physical_bytes_written
            .fetch_add(physical, Ordering::Relaxed);
        if encrypted {
            self.encrypt_ops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a `put` that found its block already stored.
    #[inline]
    pub fn record_dedup_hit(&self, logical: u64) {
        self.dedup_hits.fetch_add(1, Ordering::Relaxed);
        self.logical_bytes_in.fetch_add(logical, Ordering::Relaxed);
    }

    /// Record one block read back by a restore.
    #[inline]
    pub fn record_restore(&self, bytes: u64) {
        self.blocks_restored.fetch_add(1, Ordering::Relaxed);
        self.bytes_restored.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a completed garbage collection run.
    #[inline]
    pub fn record_gc(&self, bytes_freed: u64) {
        self.gc_runs.fetch_add(1, Ordering::Relaxed);
        self.gc_bytes_freed.fetch_add(bytes_freed, Ordering::Relaxed);
    }

    /// Record blocks that failed a scrub.
    #[inline]
    pub fn record_scrub_failures(&self, count: u64) {
        self.scrub_failures.fetch_add(count, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> DedupMetricsSnapshot {
        let blocks_written = self.blocks_written.load(Ordering::Relaxed);
        let dedup_hits = self.dedup_hits.load(Ordering::Relaxed);
        let total_puts = blocks_written.saturating_add(dedup_hits);
        DedupMetricsSnapshot {
            blocks_written,
            dedup_hits,
            logical_bytes_in: self.logical_bytes_in.load(Ordering::Relaxed),
            physical_bytes_written: self.physical_bytes_written.load(Ordering::Relaxed),
            encrypt_ops: self.encrypt_ops.load(Ordering::Relaxed),
            blocks_restored: self.blocks_restored.load(Ordering::Relaxed),
            bytes_restored: self.bytes_restored.load(Ordering::Relaxed),
            gc_runs: self.gc_runs.load(Ordering::Relaxed),
            gc_bytes_freed: self.gc_bytes_freed.load(Ordering::Relaxed),
            scrub_failures: self.scrub_failures.load(Ordering::Relaxed),
            dedup_hit_ratio: if total_puts == 0 {
                0.0
            } else {
                dedup_hits as f64 / total_puts as f64
            },
        }
    }
}

/// A point-in-time copy of [`DedupMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupMetricsSnapshot {
    /// New unique blocks written to disk.
    pub blocks_written: u64,
    /// `put` calls satisfied by an existing block.
    pub dedup_hits: u64,
    /// Plaintext bytes passed to `put`.
    pub logical_bytes_in: u64,
    /// Stored bytes written.
    pub physical_bytes_written: u64,
    /// AEAD encryptions performed.
    pub encrypt_ops: u64,
    /// Blocks read back during restores.
    pub blocks_restored: u64,
    /// Plaintext bytes produced by restores.
    pub bytes_restored: u64,
    /// Garbage collection runs completed.
    pub gc_runs: u64,
    /// Bytes freed by garbage collection.
    pub gc_bytes_freed: u64,
    /// Blocks classified corrupted or missing by scrubs.
    pub scrub_failures: u64,
    /// `dedup_hits / (dedup_hits + blocks_written)`, 0.0 before any `put`.
    pub dedup_hit_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_are_zero() {
        let snap = DedupMetrics::new().snapshot();
        assert_eq!(snap.blocks_written, 0);
        assert_eq!(snap.dedup_hits, 0);
        assert_eq!(snap.dedup_hit_ratio, 0.0);
    }

    #[test]
    fn test_block_and_hit_accounting() {
        let m = DedupMetrics::new();
        m.record_block_written(1000, 400, true);
        m.record_dedup_hit(1000);
        m.record_dedup_hit(1000);
        m.record_block_written(500, 500, false);
        let snap = m.snapshot();
        assert_eq!(snap.blocks_written, 2);
        assert_eq!(snap.dedup_hits, 2);
        assert_eq!(snap.logical_bytes_in, 3500);
        assert_eq!(snap.physical_bytes_written, 900);
        assert_eq!(snap.encrypt_ops, 1);
        assert!((snap.dedup_hit_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_lifecycle_counters() {
        let m = DedupMetrics::new();
        m.record_restore(10);
        m.record_restore(20);
        m.record_gc(4096);
        m.record_scrub_failures(3);
        let snap = m.snapshot();
        assert_eq!(snap.blocks_restored, 2);
        assert_eq!(snap.bytes_restored, 30);
        assert_eq!(snap.gc_runs, 1);
        assert_eq!(snap.gc_bytes_freed, 4096);
        assert_eq!(snap.scrub_failures, 3);
    }

    #[test]
    fn test_concurrent_updates_are_counted() {
        let m = DedupMetrics::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        m.record_dedup_hit(1);
                    }
                });
            }
        });
        assert_eq!(m.snapshot().dedup_hits, 4000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_string(&DedupMetrics::new().snapshot()).unwrap();
        assert!(json.contains("\"gc_bytes_freed\":0"));
    }
}
