//! Property-based tests for blockvault-dedup using proptest.
//!
//! Each case runs against a fresh on-disk store, so case counts are kept low.

use blockvault_dedup::{
    sha256_digest, BackupConfig, BackupService, ChunkerConfig, CompressionAlgorithm,
    ContentDefinedChunker, DedupResult,
};
use chrono::{Duration, Utc};
use proptest::prelude::*;
use tempfile::TempDir;

fn small_chunks() -> ChunkerConfig {
    ChunkerConfig {
        min_size: 64,
        avg_size: 512,
        max_size: 4096,
        window_size: 16,
        mask_bits: 8,
    }
}

fn service(dir: &TempDir, compression: CompressionAlgorithm) -> BackupService {
    let config = BackupConfig {
        compression,
        chunking: small_chunks(),
        ..BackupConfig::with_root(dir.path())
    };
    BackupService::open(config, None).unwrap()
}

fn any_algorithm() -> impl Strategy<Value = CompressionAlgorithm> {
    prop_oneof![
        Just(CompressionAlgorithm::None),
        Just(CompressionAlgorithm::Lz4),
        Just(CompressionAlgorithm::Zstd),
        Just(CompressionAlgorithm::Gzip),
    ]
}

/// Data mixing random bytes with long runs, so both boundary paths occur.
fn any_source() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..2048),
            (any::<u8>(), 0usize..6000).prop_map(|(b, n)| vec![b; n]),
        ],
        0..8,
    )
    .prop_map(|parts| parts.concat())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Restoring a backup yields the source bytes, for every codec.
    #[test]
    fn test_backup_restore_roundtrip(data in any_source(), algo in any_algorithm()) {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, algo);
        let m = svc.backup_stream("prop", &data[..], &[], None).unwrap();
        prop_assert_eq!(m.source_size, data.len() as u64);
        prop_assert_eq!(m.block_sizes.iter().sum::<u64>(), data.len() as u64);

        let restored = svc
            .restore_stream(&m.id)
            .unwrap()
            .collect::<DedupResult<Vec<_>>>()
            .unwrap()
            .concat();
        prop_assert_eq!(restored, data);
    }

    /// Chunks tile the input and respect the size bounds.
    #[test]
    fn test_chunks_tile_input(data in any_source()) {
        let config = small_chunks();
        let chunks = ContentDefinedChunker::new(config.clone()).chunk_bytes(&data);
        let mut offset = 0u64;
        for (i, chunk) in chunks.iter().enumerate() {
            prop_assert_eq!(chunk.offset, offset);
            prop_assert!(chunk.len() <= config.max_size);
            if i + 1 < chunks.len() {
                prop_assert!(chunk.len() >= config.min_size);
            }
            offset += chunk.len() as u64;
        }
        prop_assert_eq!(offset, data.len() as u64);
    }

    /// Every manifest digest is the hash of the block's plaintext.
    #[test]
    fn test_digests_address_content(data in any_source()) {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, CompressionAlgorithm::Lz4);
        let m = svc.backup_stream("addr", &data[..], &[], None).unwrap();
        for digest in &m.blocks {
            let block = svc.store().get(digest).unwrap();
            prop_assert_eq!(sha256_digest(&block), *digest);
        }
    }

    /// Reference counts equal the number of manifest entries per digest,
    /// and GC never touches a referenced block.
    #[test]
    fn test_refcounts_track_manifests(
        sources in proptest::collection::vec(any_source(), 1..4),
        delete_mask in any::<u8>(),
    ) {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, CompressionAlgorithm::Lz4);
        let manifests: Vec<_> = sources
            .iter()
            .map(|s| svc.backup_stream("rc", &s[..], &[], None).unwrap())
            .collect();

        let mut live = Vec::new();
        for (i, m) in manifests.iter().enumerate() {
            if delete_mask & (1 << i) != 0 {
                prop_assert!(svc.delete_backup(&m.id).unwrap());
            } else {
                live.push(m);
            }
        }
        svc.garbage_collect_at(Utc::now() + Duration::days(365)).unwrap();

        for record in svc.store().records() {
            let expected = live
                .iter()
                .flat_map(|m| m.blocks.iter())
                .filter(|d| **d == record.digest)
                .count() as u64;
            prop_assert_eq!(record.ref_count, expected);
            prop_assert!(expected > 0, "zero-ref block survived GC");
        }
        for (m, source) in manifests.iter().zip(&sources) {
            if live.iter().any(|l| l.id == m.id) {
                let mut out = Vec::new();
                svc.restore_stream(&m.id).unwrap().copy_to(&mut out).unwrap();
                prop_assert_eq!(&out, source);
            }
        }
    }
}
