//! Garbage collection of unreferenced blocks.
//!
//! Second phase of the two-phase delete: `delete_backup` only drops
//! references, and this sweep later removes blocks whose count reached zero
//! and whose age exceeds the grace period. The grace period covers backups
//! that wrote a block but have not finished registering references yet.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::digest::BlockDigest;
use crate::error::DedupResult;
use crate::store::{BlockRecord, BlockStore};

/// Longest representable grace period (about a thousand years).
const MAX_GRACE_HOURS: u64 = 24 * 366 * 1000;

/// Configuration for the garbage collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcConfig {
    /// Minimum age, in hours since `stored_at`, of a removable block.
    pub grace_period_hours: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_period_hours: 24,
        }
    }
}

impl GcConfig {
    /// Grace period as a chrono duration
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::hours(self.grace_period_hours.min(MAX_GRACE_HOURS) as i64)
    }
}

/// Outcome of one collection run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GcResult {
    /// Blocks physically removed
    pub orphan_blocks: usize,
    /// Unindexed block files and leftover temp files removed
    #[serde(default)]
    pub stray_files: usize,
    /// Stored bytes freed, stray files included
    pub bytes_reclaimed: u64,
    /// Wall time of the run
    pub duration: Duration,
}

/// Sweeps zero-reference blocks out of a [`BlockStore`].
#[derive(Debug, Clone, Default)]
pub struct GcEngine {
    config: GcConfig,
}

impl GcEngine {
    /// Create a new GC engine with the given configuration.
    pub fn new(config: GcConfig) -> Self {
        Self { config }
    }

    /// Whether `record` may be removed at `now`.
    pub fn is_candidate(&self, record: &BlockRecord, now: DateTime<Utc>) -> bool {
        record.ref_count == 0 && now - record.stored_at > self.config.grace_period()
    }

    /// Digests eligible for removal at `now`.
    pub fn candidates(&self, store: &BlockStore, now: DateTime<Utc>) -> Vec<BlockDigest> {
        store
            .records()
            .into_iter()
            .filter(|r| self.is_candidate(r, now))
            .map(|r| r.digest)
            .collect()
    }

    /// Remove every candidate. Each deletion re-checks the reference count
    /// under the store lock, so a block referenced again after the scan
    /// survives. Stray files older than the grace period go too.
    pub fn sweep(&self, store: &BlockStore, now: DateTime<Utc>) -> DedupResult<GcResult> {
        let start = Instant::now();
        let candidates = self.candidates(store, now);
        debug!(candidates = candidates.len(), "GC scan complete");

        let mut result = GcResult::default();
        for digest in &candidates {
            let freed = store.delete_block(digest)?;
            if freed > 0 || store.record(digest).is_none() {
                result.orphan_blocks += 1;
                result.bytes_reclaimed += freed;
            }
        }
        let cutoff = now
            .checked_sub_signed(self.config.grace_period())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let (stray_files, stray_bytes) = store.remove_stray_files(cutoff)?;
        result.stray_files = stray_files;
        result.bytes_reclaimed += stray_bytes;
        result.duration = start.elapsed();
        store.metrics().record_gc(result.bytes_reclaimed);

        info!(
            removed = result.orphan_blocks,
            stray_files = result.stray_files,
            bytes_reclaimed = result.bytes_reclaimed,
            "GC complete"
        );
        Ok(result)
    }
}
