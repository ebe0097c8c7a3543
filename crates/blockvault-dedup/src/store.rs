//! Content-addressed block store with reference counting.
//!
//! Blocks live at `blocks/<hex[0:2]>/<hex[2:4]>/<hex>` under the store root and
//! hold the compressed, optionally encrypted payload. `block_index.json` maps
//! every digest to its [`BlockRecord`] and is rewritten atomically after each
//! mutation, always while the index lock is held.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::compression::{self, CompressionAlgorithm};
use crate::config::BackupConfig;
use crate::digest::{sha256_digest, BlockDigest};
use crate::encryption::{self, EncryptionKey, EncryptionMode};
use crate::error::{DedupError, DedupResult};
use crate::metrics::DedupMetrics;
use crate::persist;

/// File name of the persisted block index.
pub const BLOCK_INDEX_FILE: &str = "block_index.json";

/// Directory (under the store root) holding block files.
pub const BLOCKS_DIR: &str = "blocks";

/// Index entry for one unique block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// SHA-256 of the plaintext
    pub digest: BlockDigest,
    /// Plaintext length
    pub size: u64,
    /// Length of the stored payload
    pub compressed_size: u64,
    /// When the block was first written; never changes
    pub stored_at: DateTime<Utc>,
    /// Number of manifest references
    pub ref_count: u64,
    /// Codec that produced the stored payload
    pub compression: CompressionAlgorithm,
    /// Whether the payload is `nonce || ciphertext`
    pub encrypted: bool,
    /// Cipher used, when recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionMode>,
    /// Last successful integrity check
    pub verified_at: Option<DateTime<Utc>>,
}

/// Aggregate size figures over every indexed block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of unique blocks
    pub unique_blocks: usize,
    /// Sum of plaintext sizes
    pub total_logical_bytes: u64,
    /// Sum of stored payload sizes
    pub total_physical_bytes: u64,
    /// `logical / physical`, 1.0 for an empty store
    pub compression_ratio: f64,
}

/// Outcome of re-reading one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockHealth {
    /// Plaintext hashes back to its digest
    Ok,
    /// Payload could not be decoded or hashes to something else
    Corrupted,
    /// Block file (or index entry) is gone
    Missing,
}

type BlockIndex = BTreeMap<BlockDigest, BlockRecord>;

/// The content-addressed store.
///
/// All index reads and writes serialize through one mutex; compression,
/// encryption and block file I/O for new blocks happen outside it.
pub struct BlockStore {
    root: PathBuf,
    blocks_dir: PathBuf,
    index_path: PathBuf,
    index: Mutex<BlockIndex>,
    compression: CompressionAlgorithm,
    compression_level: i32,
    encryption: EncryptionMode,
    key: Option<EncryptionKey>,
    metrics: DedupMetrics,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("root", &self.root)
            .field("blocks", &self.index.lock().len())
            .field("compression", &self.compression)
            .field("encryption", &self.encryption)
            .finish_non_exhaustive()
    }
}

impl BlockStore {
    /// Open (or create) the store under `config.store_root`.
    ///
    /// Fails with [`DedupError::MissingKey`] when encryption is configured
    /// without a key, and with [`DedupError::IndexCorrupted`] when an
    /// existing index cannot be parsed.
    pub fn open(config: &BackupConfig, key: Option<EncryptionKey>) -> DedupResult<Self> {
        config.validate()?;
        if config.encryption.is_enabled() {
            if !cfg!(feature = "encryption") {
                return Err(DedupError::EncryptionUnavailable);
            }
            if key.is_none() {
                return Err(DedupError::MissingKey);
            }
        }

        let root = config.store_root.clone();
        let blocks_dir = root.join(BLOCKS_DIR);
        fs::create_dir_all(&blocks_dir)?;
        let index_path = root.join(BLOCK_INDEX_FILE);
        let index: BlockIndex = persist::load_json(&index_path)?;
        info!(root = %root.display(), blocks = index.len(), "opened block store");

        Ok(Self {
            root,
            blocks_dir,
            index_path,
            index: Mutex::new(index),
            compression: config.compression,
            compression_level: config.compression_level,
            encryption: config.encryption,
            key,
            metrics: DedupMetrics::new(),
        })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Counters for this store instance
    pub fn metrics(&self) -> &DedupMetrics {
        &self.metrics
    }

    /// On-disk location of a block file.
    pub fn block_path(&self, digest: &BlockDigest) -> PathBuf {
        self.blocks_dir.join(digest.shard_path())
    }

    /// Store a chunk, returning its digest and plaintext length.
    ///
    /// A chunk whose digest is already indexed only gains a reference; no
    /// payload work is repeated.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn put(&self, data: &[u8]) -> DedupResult<(BlockDigest, usize)> {
        let digest = sha256_digest(data);
        let size = data.len();

        {
            let mut index = self.index.lock();
            if let Some(record) = index.get_mut(&digest) {
                record.ref_count += 1;
                let ref_count = record.ref_count;
                if let Err(e) = self.persist_locked(&index) {
                    if let Some(record) = index.get_mut(&digest) {
                        record.ref_count -= 1;
                    }
                    return Err(e);
                }
                self.metrics.record_dedup_hit(size as u64);
                debug!(digest = %digest.short(), ref_count, "block already stored");
                return Ok((digest, size));
            }
        }

        let (payload, algo) = compression::compress(data, self.compression, self.compression_level)?;
        let (payload, cipher) = if self.encryption.is_enabled() {
            let key = self.key.as_ref().ok_or(DedupError::MissingKey)?;
            (
                encryption::encrypt(&payload, key, self.encryption)?,
                Some(self.encryption),
            )
        } else {
            (payload, None)
        };

        let path = self.block_path(&digest);
        persist::write_atomic(&path, &payload)?;

        let mut index = self.index.lock();
        if !index.contains_key(&digest) && !path.exists() {
            // A stray-file sweep removed it between the write and this lock.
            persist::write_atomic(&path, &payload)?;
        }
        let inserted = match index.entry(digest) {
            Entry::Occupied(mut e) => {
                // Another writer stored the same content first.
                e.get_mut().ref_count += 1;
                false
            }
            Entry::Vacant(e) => {
                e.insert(BlockRecord {
                    digest,
                    size: size as u64,
                    compressed_size: payload.len() as u64,
                    stored_at: Utc::now(),
                    ref_count: 1,
                    compression: algo,
                    encrypted: cipher.is_some(),
                    encryption: cipher,
                    verified_at: None,
                });
                true
            }
        };
        if let Err(e) = self.persist_locked(&index) {
            // The block file stays: a concurrent writer of the same digest
            // may own it, and a later put rewrites it.
            if inserted {
                index.remove(&digest);
            } else if let Some(record) = index.get_mut(&digest) {
                record.ref_count -= 1;
            }
            return Err(e);
        }

        if inserted {
            self.metrics
                .record_block_written(size as u64, payload.len() as u64, cipher.is_some());
            debug!(
                digest = %digest.short(),
                size,
                stored = payload.len(),
                compression = %algo,
                "stored block"
            );
        } else {
            self.metrics.record_dedup_hit(size as u64);
        }
        Ok((digest, size))
    }

    /// Read a block back as plaintext. Trusts the index; no digest check.
    pub fn get(&self, digest: &BlockDigest) -> DedupResult<Vec<u8>> {
        let record = self
            .record(digest)
            .ok_or(DedupError::BlockNotFound { digest: *digest })?;
        let stored = fs::read(self.block_path(digest))?;
        let compressed = self.open_payload(&record, stored)?;
        compression::decompress(&compressed, record.compression)
    }

    /// Stream a block's plaintext into `writer`, returning the byte count.
    ///
    /// Unencrypted blocks are decompressed straight from the file in bounded
    /// reads. Encrypted blocks are authenticated as a whole first.
    pub fn read_into<W: Write + ?Sized>(
        &self,
        digest: &BlockDigest,
        writer: &mut W,
    ) -> DedupResult<u64> {
        let record = self
            .record(digest)
            .ok_or(DedupError::BlockNotFound { digest: *digest })?;
        let path = self.block_path(digest);

        let pieces = if record.encrypted {
            let compressed = self.open_payload(&record, fs::read(&path)?)?;
            copy_pieces(
                compression::decompress_stream(std::io::Cursor::new(compressed), record.compression)?,
                writer,
            )?
        } else {
            let file = BufReader::new(File::open(&path)?);
            copy_pieces(compression::decompress_stream(file, record.compression)?, writer)?
        };
        Ok(pieces)
    }

    fn open_payload(&self, record: &BlockRecord, stored: Vec<u8>) -> DedupResult<Vec<u8>> {
        if !record.encrypted {
            return Ok(stored);
        }
        let mode = record.encryption.unwrap_or(self.encryption);
        if !mode.is_enabled() {
            return Err(DedupError::EncryptionFailed(format!(
                "block {} is encrypted but no cipher is recorded or configured",
                record.digest.short()
            )));
        }
        let key = self.key.as_ref().ok_or(DedupError::MissingKey)?;
        encryption::decrypt(&stored, key, mode)
    }

    /// Re-read a block and compare its plaintext hash with its digest.
    /// A passing block gets `verified_at` set in memory.
    pub fn check(&self, digest: &BlockDigest) -> BlockHealth {
        match self.get(digest) {
            Ok(data) if sha256_digest(&data) == *digest => {
                if let Some(record) = self.index.lock().get_mut(digest) {
                    record.verified_at = Some(Utc::now());
                }
                BlockHealth::Ok
            }
            Ok(_) => {
                warn!(digest = %digest.short(), "block content does not match its digest");
                BlockHealth::Corrupted
            }
            Err(DedupError::BlockNotFound { .. }) => BlockHealth::Missing,
            Err(e) if e.is_missing_file() => {
                warn!(digest = %digest.short(), "block file is missing");
                BlockHealth::Missing
            }
            Err(e) => {
                warn!(digest = %digest.short(), error = %e, "block failed verification");
                BlockHealth::Corrupted
            }
        }
    }

    /// True when the block reads back and hashes to its digest.
    pub fn verify(&self, digest: &BlockDigest) -> bool {
        self.check(digest) == BlockHealth::Ok
    }

    /// Drop one reference. Never deletes; that is [`BlockStore::delete_block`].
    pub fn decrement_ref(&self, digest: &BlockDigest) -> DedupResult<()> {
        self.decrement_refs(std::slice::from_ref(digest))
    }

    /// Drop one reference per listed digest (repeats count repeatedly) and
    /// persist the index once.
    pub fn decrement_refs(&self, digests: &[BlockDigest]) -> DedupResult<()> {
        if digests.is_empty() {
            return Ok(());
        }
        let mut index = self.index.lock();
        for digest in digests {
            match index.get_mut(digest) {
                Some(record) if record.ref_count > 0 => record.ref_count -= 1,
                Some(_) => {
                    warn!(digest = %digest.short(), "reference count already zero");
                }
                None => {
                    warn!(digest = %digest.short(), "decrement of unknown block");
                }
            }
        }
        self.persist_locked(&index)
    }

    /// Physically remove an unreferenced block, returning the bytes freed.
    /// Referenced or unknown blocks are left alone and yield 0.
    pub fn delete_block(&self, digest: &BlockDigest) -> DedupResult<u64> {
        let mut index = self.index.lock();
        let Some(record) = index.get(digest) else {
            return Ok(0);
        };
        if record.ref_count > 0 {
            warn!(
                digest = %digest.short(),
                ref_count = record.ref_count,
                "refusing to delete referenced block"
            );
            return Ok(0);
        }
        let freed = record.compressed_size;

        match fs::remove_file(self.block_path(digest)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        index.remove(digest);
        self.persist_locked(&index)?;
        debug!(digest = %digest.short(), freed, "deleted block");
        Ok(freed)
    }

    /// Remove files no index entry accounts for, last modified before
    /// `cutoff`: unindexed block files and leftover temp siblings of block
    /// files and index files. Returns the file count and bytes freed.
    ///
    /// Such files come from crashes or failed index writes between a block
    /// write and its registration. Unrecognised file names are left alone.
    pub fn remove_stray_files(&self, cutoff: DateTime<Utc>) -> DedupResult<(usize, u64)> {
        let mut candidates = Vec::new();
        collect_files(&self.blocks_dir, &mut candidates)?;
        // At the root only index temp files are candidates.
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.file_type()?.is_file() && name.starts_with('.') && name.ends_with(".tmp") {
                candidates.push(entry.path());
            }
        }

        let mut removed = 0usize;
        let mut freed = 0u64;
        for path in candidates {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let is_temp = name.starts_with('.') && name.ends_with(".tmp");
            let digest = name.parse::<BlockDigest>().ok();
            if !is_temp && digest.is_none() {
                continue;
            }

            let index = self.index.lock();
            if digest.is_some_and(|d| index.contains_key(&d) && self.block_path(&d) == path) {
                continue;
            }
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let modified: DateTime<Utc> = meta.modified()?.into();
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    freed += meta.len();
                    debug!(path = %path.display(), bytes = meta.len(), "removed stray file");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok((removed, freed))
    }

    /// Aggregate sizes over the index.
    pub fn stats(&self) -> StoreStats {
        let index = self.index.lock();
        let total_logical_bytes: u64 = index.values().map(|r| r.size).sum();
        let total_physical_bytes: u64 = index.values().map(|r| r.compressed_size).sum();
        StoreStats {
            unique_blocks: index.len(),
            total_logical_bytes,
            total_physical_bytes,
            compression_ratio: if total_physical_bytes == 0 {
                1.0
            } else {
                total_logical_bytes as f64 / total_physical_bytes as f64
            },
        }
    }

    /// Copy of a block's index entry
    pub fn record(&self, digest: &BlockDigest) -> Option<BlockRecord> {
        self.index.lock().get(digest).cloned()
    }

    /// Current reference count, if indexed
    pub fn ref_count(&self, digest: &BlockDigest) -> Option<u64> {
        self.index.lock().get(digest).map(|r| r.ref_count)
    }

    /// Snapshot of all index entries, in digest order
    pub fn records(&self) -> Vec<BlockRecord> {
        self.index.lock().values().cloned().collect()
    }

    /// All indexed digests, in digest order
    pub fn digests(&self) -> Vec<BlockDigest> {
        self.index.lock().keys().copied().collect()
    }

    /// Number of indexed blocks
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    /// True when no blocks are indexed
    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    /// Write the index to disk.
    pub fn persist(&self) -> DedupResult<()> {
        let index = self.index.lock();
        self.persist_locked(&index)
    }

    fn persist_locked(&self, index: &BlockIndex) -> DedupResult<()> {
        persist::write_json_atomic(&self.index_path, index)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> DedupResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

fn copy_pieces<W: Write + ?Sized>(
    pieces: compression::DecompressStream<'_>,
    writer: &mut W,
) -> DedupResult<u64> {
    let mut written = 0u64;
    for piece in pieces {
        let piece = piece?;
        writer.write_all(&piece)?;
        written += piece.len() as u64;
    }
    Ok(written)
}
