//! Backup orchestration: chunk sources into the block store, rebuild them
//! from manifests, and run the lifecycle sweeps.

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::chunker::ContentDefinedChunker;
use crate::config::BackupConfig;
use crate::digest::BlockDigest;
use crate::error::{DedupError, DedupResult};
use crate::gc::{GcConfig, GcEngine, GcResult};
use crate::keys::KeyProvider;
use crate::manifest::{BackupManifest, ManifestExport, ManifestIndex};
use crate::metrics::DedupMetricsSnapshot;
use crate::scrub::{scrub_store, ScrubResult};
use crate::store::BlockStore;

/// Store-wide deduplication figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupStats {
    /// Number of unique blocks
    pub unique_blocks: usize,
    /// Sum of plaintext sizes of unique blocks
    pub total_logical_bytes: u64,
    /// Sum of stored payload sizes
    pub total_physical_bytes: u64,
    /// `total_logical_bytes / total_physical_bytes`
    pub compression_ratio: f64,
    /// `total_backup_size / total_physical_bytes`
    pub dedup_ratio: f64,
    /// Number of manifests
    pub backup_count: usize,
    /// Sum of `source_size` over all manifests
    pub total_backup_size: u64,
    /// `total_backup_size - total_physical_bytes`; negative when overhead wins
    pub space_saved_bytes: i64,
}

/// The deduplicating backup engine.
///
/// Calls are synchronous and sequential within one call. The service is
/// `Sync`, so callers may run backups of different sources on several
/// threads against one instance.
pub struct BackupService {
    config: BackupConfig,
    store: BlockStore,
    manifests: ManifestIndex,
    chunker: ContentDefinedChunker,
    gc: GcEngine,
}

impl BackupService {
    /// Open the store described by `config`. A key is fetched from `keys`
    /// only when encryption is enabled.
    pub fn open(config: BackupConfig, keys: Option<&dyn KeyProvider>) -> DedupResult<Self> {
        let key = if config.encryption.is_enabled() {
            Some(keys.ok_or(DedupError::MissingKey)?.key()?)
        } else {
            None
        };
        let store = BlockStore::open(&config, key)?;
        let manifests = ManifestIndex::open(&config.store_root)?;
        Ok(Self {
            chunker: ContentDefinedChunker::new(config.chunking.clone()),
            gc: GcEngine::new(GcConfig {
                grace_period_hours: config.gc_grace_period_hours,
            }),
            config,
            store,
            manifests,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Underlying block store
    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Back up one file. `retention_days` of `None` or `0` never expires.
    #[instrument(skip(self, path, tags), fields(path = %path.display()))]
    pub fn backup_file(
        &self,
        path: &Path,
        tags: &[&str],
        retention_days: Option<u32>,
    ) -> DedupResult<BackupManifest> {
        let not_found = |e: std::io::Error| {
            if e.kind() == ErrorKind::NotFound {
                DedupError::SourceNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                DedupError::Io(e)
            }
        };
        let source = fs::canonicalize(path).map_err(not_found)?;
        let file = File::open(&source).map_err(not_found)?;

        let now = Utc::now();
        let mut manifest = BackupManifest::new(source.display().to_string(), now);
        manifest.tags = tags.iter().map(|t| t.to_string()).collect();
        manifest.retention_until = match retention_days.filter(|days| *days > 0) {
            Some(days) => Some(
                now.checked_add_signed(Duration::days(i64::from(days)))
                    .ok_or_else(|| {
                        DedupError::InvalidConfig(format!(
                            "retention of {} days is past the last representable date",
                            days
                        ))
                    })?,
            ),
            None => None,
        };

        self.ingest(&mut manifest, file)?;
        info!(
            manifest_id = %manifest.short_id(),
            blocks = manifest.blocks.len(),
            bytes = manifest.source_size,
            "backup created"
        );
        Ok(manifest)
    }

    /// Back up an arbitrary byte stream under the name `source`.
    #[instrument(skip(self, stream, tags))]
    pub fn backup_stream<R: Read>(
        &self,
        source: &str,
        stream: R,
        tags: &[&str],
        parent_id: Option<&str>,
    ) -> DedupResult<BackupManifest> {
        let mut manifest = BackupManifest::new(source, Utc::now());
        manifest.tags = tags.iter().map(|t| t.to_string()).collect();
        manifest.parent_id = parent_id.map(str::to_string);

        self.ingest(&mut manifest, stream)?;
        info!(
            manifest_id = %manifest.short_id(),
            blocks = manifest.blocks.len(),
            bytes = manifest.source_size,
            "stream backup created"
        );
        Ok(manifest)
    }

    /// Chunk `reader` into the store and persist `manifest`. On any failure
    /// the references already taken are released and nothing is persisted.
    fn ingest<R: Read>(&self, manifest: &mut BackupManifest, reader: R) -> DedupResult<()> {
        for chunk in self.chunker.chunk_reader(reader) {
            let stored = chunk
                .map_err(DedupError::from)
                .and_then(|c| self.store.put(&c.data));
            match stored {
                Ok((digest, size)) => manifest.push_block(digest, size as u64),
                Err(e) => {
                    self.release(&manifest.blocks);
                    return Err(e);
                }
            }
        }
        if let Err(e) = self.manifests.insert(manifest.clone()) {
            self.release(&manifest.blocks);
            return Err(e);
        }
        Ok(())
    }

    fn release(&self, blocks: &[BlockDigest]) {
        if let Err(e) = self.store.decrement_refs(blocks) {
            warn!(blocks = blocks.len(), error = %e, "failed to release references of aborted backup");
        }
    }

    /// Rebuild a backup into `output_path`, returning the bytes written.
    ///
    /// Data goes to a sibling `.partial` file that is renamed into place once
    /// complete, so a failed restore never leaves a truncated output behind.
    #[instrument(skip(self, output_path), fields(output = %output_path.display()))]
    pub fn restore_to_file(&self, manifest_id: &str, output_path: &Path) -> DedupResult<u64> {
        let manifest = self.manifest(manifest_id)?;
        let partial = partial_path(output_path);

        let written = (|| -> DedupResult<u64> {
            let mut writer = BufWriter::new(File::create(&partial)?);
            let mut written = 0u64;
            for digest in &manifest.blocks {
                let n = self.store.read_into(digest, &mut writer)?;
                self.store.metrics().record_restore(n);
                written += n;
            }
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            Ok(written)
        })();

        let renamed = written.and_then(|n| {
            fs::rename(&partial, output_path)?;
            Ok(n)
        });
        let written = match renamed {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };
        info!(manifest_id = %manifest.short_id(), bytes = written, "restore complete");
        Ok(written)
    }

    /// Lazily yield a backup's blocks in order.
    pub fn restore_stream(&self, manifest_id: &str) -> DedupResult<RestoreStream<'_>> {
        let manifest = self.manifest(manifest_id)?;
        Ok(RestoreStream {
            store: &self.store,
            blocks: manifest.blocks.into_iter(),
            failed: false,
        })
    }

    /// Delete a manifest and release its block references. Blocks are left
    /// for [`BackupService::garbage_collect`]. Returns false for an unknown id.
    pub fn delete_backup(&self, manifest_id: &str) -> DedupResult<bool> {
        let Some(manifest) = self.manifests.remove(manifest_id)? else {
            return Ok(false);
        };
        self.store.decrement_refs(&manifest.blocks)?;
        info!(manifest_id = %manifest.short_id(), blocks = manifest.blocks.len(), "deleted backup");
        Ok(true)
    }

    /// Verify up to `max_blocks` stored blocks; `None` or `Some(0)` checks all.
    pub fn scrub(&self, max_blocks: Option<usize>) -> DedupResult<ScrubResult> {
        scrub_store(&self.store, max_blocks)
    }

    /// Remove zero-reference blocks older than the grace period.
    pub fn garbage_collect(&self) -> DedupResult<GcResult> {
        self.garbage_collect_at(Utc::now())
    }

    /// [`BackupService::garbage_collect`] evaluated at `now`.
    pub fn garbage_collect_at(&self, now: DateTime<Utc>) -> DedupResult<GcResult> {
        self.gc.sweep(&self.store, now)
    }

    /// Delete every backup whose retention has passed, returning their ids.
    pub fn apply_retention(&self) -> DedupResult<Vec<String>> {
        self.apply_retention_at(Utc::now())
    }

    /// [`BackupService::apply_retention`] evaluated at `now`.
    pub fn apply_retention_at(&self, now: DateTime<Utc>) -> DedupResult<Vec<String>> {
        let mut expired = Vec::new();
        for id in self.manifests.expired_ids(now) {
            if self.delete_backup(&id)? {
                expired.push(id);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "retention expired backups");
        }
        Ok(expired)
    }

    /// Manifests matching the filters, newest first. `source_filter` is a
    /// substring match; `tag_filter` must equal one of the tags.
    pub fn list_backups(
        &self,
        source_filter: Option<&str>,
        tag_filter: Option<&str>,
    ) -> Vec<BackupManifest> {
        let mut found = self
            .manifests
            .filter(|m| m.matches(source_filter, tag_filter));
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found
    }

    /// Store and manifest totals.
    pub fn dedup_stats(&self) -> DedupStats {
        let store = self.store.stats();
        let total_backup_size = self.manifests.total_source_size();
        let physical = store.total_physical_bytes;
        DedupStats {
            unique_blocks: store.unique_blocks,
            total_logical_bytes: store.total_logical_bytes,
            total_physical_bytes: physical,
            compression_ratio: store.compression_ratio,
            dedup_ratio: if physical == 0 {
                1.0
            } else {
                total_backup_size as f64 / physical as f64
            },
            backup_count: self.manifests.len(),
            total_backup_size,
            space_saved_bytes: total_backup_size as i64 - physical as i64,
        }
    }

    /// Summary of one manifest for external tooling.
    pub fn export_manifest(&self, manifest_id: &str) -> DedupResult<ManifestExport> {
        Ok(ManifestExport::from(&self.manifest(manifest_id)?))
    }

    /// Look up a manifest by id.
    pub fn manifest(&self, manifest_id: &str) -> DedupResult<BackupManifest> {
        self.manifests
            .get(manifest_id)
            .ok_or_else(|| DedupError::BackupNotFound {
                id: manifest_id.to_string(),
            })
    }

    /// Counters since this service was opened.
    pub fn metrics(&self) -> DedupMetricsSnapshot {
        self.store.metrics().snapshot()
    }
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    output.with_file_name(name)
}

/// Plaintext blocks of one backup, in manifest order. Stops after the first
/// error.
pub struct RestoreStream<'a> {
    store: &'a BlockStore,
    blocks: std::vec::IntoIter<BlockDigest>,
    failed: bool,
}

impl RestoreStream<'_> {
    /// Blocks not yet yielded
    pub fn remaining(&self) -> usize {
        if self.failed {
            0
        } else {
            self.blocks.len()
        }
    }

    /// Write every remaining block into `writer`, returning the byte count.
    pub fn copy_to<W: Write + ?Sized>(self, writer: &mut W) -> DedupResult<u64> {
        let mut written = 0u64;
        for block in self {
            let block = block?;
            writer.write_all(&block)?;
            written += block.len() as u64;
        }
        Ok(written)
    }
}

impl Iterator for RestoreStream<'_> {
    type Item = DedupResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let digest = self.blocks.next()?;
        let block = self.store.get(&digest);
        match &block {
            Ok(data) => self.store.metrics().record_restore(data.len() as u64),
            Err(_) => self.failed = true,
        }
        Some(block)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining()))
    }
}
