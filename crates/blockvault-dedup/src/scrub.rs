//! Integrity verification (scrubbing) of stored blocks.
//!
//! A scrub re-reads blocks, decrypts and decompresses them, and checks the
//! plaintext against its digest. Problems are collected in a [`ScrubResult`]
//! rather than raised, so one bad block never stops the sweep. Nothing is
//! repaired; the store keeps a single copy of each block.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::digest::BlockDigest;
use crate::error::DedupResult;
use crate::store::{BlockHealth, BlockStore};

/// Outcome of one scrub pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrubResult {
    /// Blocks examined
    pub total_blocks: usize,
    /// Blocks whose plaintext matched their digest
    pub verified_ok: usize,
    /// Blocks that failed to decode or hash to the wrong digest
    pub corrupted: Vec<BlockDigest>,
    /// Blocks whose file is gone
    pub missing: Vec<BlockDigest>,
    /// Wall time of the pass
    pub duration: Duration,
}

impl ScrubResult {
    /// True when every examined block verified
    pub fn is_clean(&self) -> bool {
        self.corrupted.is_empty() && self.missing.is_empty()
    }
}

/// Verify up to `max_blocks` blocks in digest order, then persist the
/// refreshed `verified_at` timestamps once. `None` and `Some(0)` both mean
/// no limit.
pub fn scrub_store(store: &BlockStore, max_blocks: Option<usize>) -> DedupResult<ScrubResult> {
    let start = Instant::now();
    let mut digests = store.digests();
    if let Some(max) = max_blocks.filter(|max| *max > 0) {
        digests.truncate(max);
    }

    let mut result = ScrubResult {
        total_blocks: digests.len(),
        ..Default::default()
    };
    for digest in digests {
        match store.check(&digest) {
            BlockHealth::Ok => result.verified_ok += 1,
            BlockHealth::Corrupted => result.corrupted.push(digest),
            BlockHealth::Missing => result.missing.push(digest),
        }
    }
    if result.verified_ok > 0 {
        store.persist()?;
    }
    result.duration = start.elapsed();
    store
        .metrics()
        .record_scrub_failures((result.corrupted.len() + result.missing.len()) as u64);

    info!(
        verified_ok = result.verified_ok,
        total = result.total_blocks,
        corrupted = result.corrupted.len(),
        missing = result.missing.len(),
        "scrub complete"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;
    use tempfile::TempDir;

    #[test]
    fn test_clean_store_scrubs_ok() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(&BackupConfig::with_root(dir.path()), None).unwrap();
        for i in 0..5u8 {
            store.put(&[i; 1000]).unwrap();
        }
        let result = scrub_store(&store, None).unwrap();
        assert_eq!(result.total_blocks, 5);
        assert_eq!(result.verified_ok, 5);
        assert!(result.is_clean());
    }

    #[test]
    fn test_max_blocks_limits_the_pass() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(&BackupConfig::with_root(dir.path()), None).unwrap();
        for i in 0..5u8 {
            store.put(&[i; 100]).unwrap();
        }
        let result = scrub_store(&store, Some(2)).unwrap();
        assert_eq!(result.total_blocks, 2);
        assert_eq!(result.verified_ok, 2);
    }

    #[test]
    fn test_zero_max_blocks_means_unlimited() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(&BackupConfig::with_root(dir.path()), None).unwrap();
        for i in 0..4u8 {
            store.put(&[i; 64]).unwrap();
        }
        let result = scrub_store(&store, Some(0)).unwrap();
        assert_eq!(result.total_blocks, 4);
        assert_eq!(result.verified_ok, 4);
    }

    #[test]
    fn test_classifies_missing_and_corrupted() {
        let dir = TempDir::new().unwrap();
        let config = BackupConfig {
            compression: crate::compression::CompressionAlgorithm::None,
            ..BackupConfig::with_root(dir.path())
        };
        let store = BlockStore::open(&config, None).unwrap();
        let (good, _) = store.put(b"good block").unwrap();
        let (bad, _) = store.put(b"bad block").unwrap();
        let (gone, _) = store.put(b"gone block").unwrap();

        std::fs::write(store.block_path(&bad), b"bad bloc!").unwrap();
        std::fs::remove_file(store.block_path(&gone)).unwrap();

        let result = scrub_store(&store, None).unwrap();
        assert_eq!(result.total_blocks, 3);
        assert_eq!(result.verified_ok, 1);
        assert_eq!(result.corrupted, vec![bad]);
        assert_eq!(result.missing, vec![gone]);
        assert!(store.record(&good).unwrap().verified_at.is_some());
        assert!(store.record(&bad).unwrap().verified_at.is_none());
        assert_eq!(store.metrics().snapshot().scrub_failures, 2);
    }

    #[test]
    fn test_verified_at_is_persisted() {
        let dir = TempDir::new().unwrap();
        let config = BackupConfig::with_root(dir.path());
        let digest = {
            let store = BlockStore::open(&config, None).unwrap();
            let (d, _) = store.put(b"check me").unwrap();
            scrub_store(&store, None).unwrap();
            d
        };
        let store = BlockStore::open(&config, None).unwrap();
        assert!(store.record(&digest).unwrap().verified_at.is_some());
    }
}
