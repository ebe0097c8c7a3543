//! Backup manifests and their persisted index (`manifests.json`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::digest::BlockDigest;
use crate::error::DedupResult;
use crate::persist;

/// File name of the persisted manifest index.
pub const MANIFEST_INDEX_FILE: &str = "manifests.json";

/// Description of one completed backup.
///
/// Concatenating the plaintext of `blocks` in order reproduces the source
/// exactly; the order is never changed after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Unique id (UUID v4)
    pub id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Source path or stream name
    pub source: String,
    /// Sum of plaintext block sizes
    #[serde(default)]
    pub source_size: u64,
    /// Ordered block digests
    pub blocks: Vec<BlockDigest>,
    /// Plaintext size of each block, parallel to `blocks`
    #[serde(default)]
    pub block_sizes: Vec<u64>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Previous manifest in an incremental chain (opaque)
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Expiry time; `None` keeps the backup until deleted
    #[serde(default)]
    pub retention_until: Option<DateTime<Utc>>,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
}

impl BackupManifest {
    /// Start a manifest for `source` with a fresh id and no blocks.
    pub fn new(source: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at,
            source: source.into(),
            source_size: 0,
            blocks: Vec::new(),
            block_sizes: Vec::new(),
            metadata: BTreeMap::new(),
            parent_id: None,
            retention_until: None,
            tags: Vec::new(),
        }
    }

    /// Append one block reference.
    pub fn push_block(&mut self, digest: BlockDigest, size: u64) {
        self.blocks.push(digest);
        self.block_sizes.push(size);
        self.source_size += size;
    }

    /// First eight characters of the id, for log lines.
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }

    /// True once `retention_until` is strictly before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.retention_until.is_some_and(|until| until < now)
    }

    /// Whether this manifest passes the optional listing filters: `source`
    /// is a substring match, `tag` must be one of the manifest's tags.
    pub fn matches(&self, source: Option<&str>, tag: Option<&str>) -> bool {
        source.map_or(true, |s| self.source.contains(s))
            && tag.map_or(true, |t| self.tags.iter().any(|x| x == t))
    }
}

/// Manifest summary for external tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestExport {
    /// Manifest id
    pub id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Source path or stream name
    pub source: String,
    /// Sum of plaintext block sizes
    pub source_size: u64,
    /// Number of block references
    pub block_count: usize,
    /// Ordered block digests
    pub blocks: Vec<BlockDigest>,
    /// Plaintext size of each block
    pub block_sizes: Vec<u64>,
    /// Tags
    pub tags: Vec<String>,
    /// Parent manifest id
    pub parent_id: Option<String>,
}

impl From<&BackupManifest> for ManifestExport {
    fn from(m: &BackupManifest) -> Self {
        Self {
            id: m.id.clone(),
            created_at: m.created_at,
            source: m.source.clone(),
            source_size: m.source_size,
            block_count: m.blocks.len(),
            blocks: m.blocks.clone(),
            block_sizes: m.block_sizes.clone(),
            tags: m.tags.clone(),
            parent_id: m.parent_id.clone(),
        }
    }
}

/// All manifests of a store, persisted as one JSON map keyed by id.
pub struct ManifestIndex {
    path: PathBuf,
    manifests: Mutex<BTreeMap<String, BackupManifest>>,
}

impl ManifestIndex {
    /// Load `manifests.json` from `root`; a missing file is an empty index.
    pub fn open(root: &Path) -> DedupResult<Self> {
        let path = root.join(MANIFEST_INDEX_FILE);
        let manifests: BTreeMap<String, BackupManifest> = persist::load_json(&path)?;
        info!(count = manifests.len(), "loaded backup manifests");
        Ok(Self {
            path,
            manifests: Mutex::new(manifests),
        })
    }

    /// Add a manifest and persist. On failure the index is unchanged.
    pub fn insert(&self, manifest: BackupManifest) -> DedupResult<()> {
        let mut manifests = self.manifests.lock();
        let id = manifest.id.clone();
        let previous = manifests.insert(id.clone(), manifest);
        if let Err(e) = persist::write_json_atomic(&self.path, &*manifests) {
            match previous {
                Some(p) => manifests.insert(id, p),
                None => manifests.remove(&id),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove a manifest and persist, returning it if it existed.
    pub fn remove(&self, id: &str) -> DedupResult<Option<BackupManifest>> {
        let mut manifests = self.manifests.lock();
        let Some(removed) = manifests.remove(id) else {
            return Ok(None);
        };
        if let Err(e) = persist::write_json_atomic(&self.path, &*manifests) {
            manifests.insert(removed.id.clone(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    /// Copy of one manifest
    pub fn get(&self, id: &str) -> Option<BackupManifest> {
        self.manifests.lock().get(id).cloned()
    }

    /// Copies of every manifest matching `pred`
    pub fn filter<F: Fn(&BackupManifest) -> bool>(&self, pred: F) -> Vec<BackupManifest> {
        self.manifests
            .lock()
            .values()
            .filter(|m| pred(m))
            .cloned()
            .collect()
    }

    /// Ids of manifests expired at `now`
    pub fn expired_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        self.manifests
            .lock()
            .values()
            .filter(|m| m.is_expired(now))
            .map(|m| m.id.clone())
            .collect()
    }

    /// Number of manifests
    pub fn len(&self) -> usize {
        self.manifests.lock().len()
    }

    /// True when there are no manifests
    pub fn is_empty(&self) -> bool {
        self.manifests.lock().is_empty()
    }

    /// Sum of `source_size` over all manifests
    pub fn total_source_size(&self) -> u64 {
        self.manifests.lock().values().map(|m| m.source_size).sum()
    }
}
