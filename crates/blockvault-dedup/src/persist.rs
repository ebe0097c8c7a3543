//! Crash-safe file replacement for block files and JSON indices

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DedupError, DedupResult};

/// Unique sibling path used while writing `path`. Concurrent writers of the
/// same target never share a temp file.
fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// Write `bytes` to `path` so that readers see either the old or the new
/// contents, never a torn file: write a temp sibling, fsync, rename over.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> DedupResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()
    })();
    if let Err(e) = written.and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> DedupResult<()> {
    let encoded = serde_json::to_vec_pretty(value).map_err(|e| DedupError::IndexCorrupted {
        path: path.to_path_buf(),
        reason: format!("failed to serialize: {}", e),
    })?;
    write_atomic(path, &encoded)
}

/// Load a JSON index. A missing file yields `T::default()`; a file that
/// exists but does not parse is [`DedupError::IndexCorrupted`].
pub fn load_json<T: DeserializeOwned + Default>(path: &Path) -> DedupResult<T> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes).map_err(|e| DedupError::IndexCorrupted {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.json");
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u64);
        write_json_atomic(&path, &map).unwrap();
        let back: BTreeMap<String, u64> = load_json(&path).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let back: BTreeMap<String, u64> = load_json(&dir.path().join("none.json")).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn test_garbage_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        fs::write(&path, b"{ not json").unwrap();
        let err = load_json::<BTreeMap<String, u64>>(&path).unwrap_err();
        assert!(matches!(err, DedupError::IndexCorrupted { .. }));
    }

    #[test]
    fn test_overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
