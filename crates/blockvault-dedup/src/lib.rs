#![warn(missing_docs)]

//! BlockVault backup engine: content-defined chunking, SHA-256 content-addressed
//! block store with reference counting, LZ4/Zstd/Gzip compression, AEAD encryption
//!
//! Write path: Source → Chunk (rolling-hash CDC) → SHA-256 → Dedupe → Compress → Encrypt → Block file
//! Read path:  Manifest → Block file → Decrypt → Decompress → Source bytes
//!
//! Lifecycle: delete (drop refs) → GC (remove zero-ref blocks past grace) · scrub · retention

pub mod chunker;
pub mod compression;
pub mod config;
pub mod digest;
pub mod encryption;
pub mod error;
pub mod gc;
pub mod keys;
pub mod manifest;
pub mod metrics;
pub mod persist;
pub mod rolling_hash;
pub mod scrub;
pub mod service;
pub mod store;

pub use chunker::{Chunk, ChunkStream, ChunkerConfig, ContentDefinedChunker};
pub use compression::CompressionAlgorithm;
pub use config::BackupConfig;
pub use digest::{sha256_digest, BlockDigest};
pub use encryption::{EncryptionKey, EncryptionMode};
pub use error::{DedupError, DedupResult};
pub use gc::{GcConfig, GcEngine, GcResult};
pub use keys::{EnvKeyProvider, FileKeyProvider, KeyProvider, StaticKeyProvider};
pub use manifest::{BackupManifest, ManifestExport, ManifestIndex};
pub use metrics::{DedupMetrics, DedupMetricsSnapshot};
pub use rolling_hash::RollingHash;
pub use scrub::ScrubResult;
pub use service::{BackupService, DedupStats, RestoreStream};
pub use store::{BlockHealth, BlockRecord, BlockStore, StoreStats};
