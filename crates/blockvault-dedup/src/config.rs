//! Engine configuration, loadable from TOML or JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chunker::ChunkerConfig;
use crate::compression::CompressionAlgorithm;
use crate::encryption::EncryptionMode;
use crate::error::{DedupError, DedupResult};

/// Configuration for a backup store and the service over it.
///
/// Key material is deliberately absent; it is supplied through
/// [`crate::keys::KeyProvider`] when the service is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory holding `blocks/`, `block_index.json` and `manifests.json`
    pub store_root: PathBuf,
    /// Codec for newly written blocks
    pub compression: CompressionAlgorithm,
    /// Codec level (zstd 1-22, gzip clamped to 9, ignored by lz4)
    pub compression_level: i32,
    /// Cipher for newly written blocks
    pub encryption: EncryptionMode,
    /// Content-defined chunking parameters
    pub chunking: ChunkerConfig,
    /// Minimum age of a zero-reference block before GC may remove it
    pub gc_grace_period_hours: u64,
    /// Advisory scrub cadence for an external scheduler
    pub scrub_interval_hours: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from(".backup_store"),
            compression: CompressionAlgorithm::Lz4,
            compression_level: 3,
            encryption: EncryptionMode::None,
            chunking: ChunkerConfig::default(),
            gc_grace_period_hours: 24,
            scrub_interval_hours: 168,
        }
    }
}

impl BackupConfig {
    /// Default configuration rooted at `store_root`.
    pub fn with_root(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            ..Self::default()
        }
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> DedupResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: BackupConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| DedupError::InvalidConfig(format!("{}: {}", path.display(), e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| DedupError::InvalidConfig(format!("{}: {}", path.display(), e)))?,
            _ => {
                return Err(DedupError::InvalidConfig(format!(
                    "unsupported config file extension: {:?}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check parameter ranges. Key presence is checked when the store opens.
    pub fn validate(&self) -> DedupResult<()> {
        self.chunking.validate()?;
        if self.store_root.as_os_str().is_empty() {
            return Err(DedupError::InvalidConfig("store_root must not be empty".into()));
        }
        if !self.compression.is_available() {
            tracing::warn!(
                algorithm = %self.compression,
                "configured compression is not compiled in; blocks will be stored uncompressed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = BackupConfig::default();
        assert_eq!(config.store_root, PathBuf::from(".backup_store"));
        assert_eq!(config.compression, CompressionAlgorithm::Lz4);
        assert_eq!(config.compression_level, 3);
        assert_eq!(config.encryption, EncryptionMode::None);
        assert_eq!(config.chunking.min_size, 4096);
        assert_eq!(config.chunking.max_size, 1024 * 1024);
        assert_eq!(config.chunking.mask_bits, 16);
        assert_eq!(config.gc_grace_period_hours, 24);
        assert_eq!(config.scrub_interval_hours, 168);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
store_root = "/srv/backups"
compression = "zstd"
compression_level = 9
encryption = "chacha20-poly1305"
gc_grace_period_hours = 1

[chunking]
min_size = 2048
mask_bits = 12
"#
        )
        .unwrap();

        let config = BackupConfig::from_file(file.path()).unwrap();
        assert_eq!(config.store_root, PathBuf::from("/srv/backups"));
        assert_eq!(config.compression, CompressionAlgorithm::Zstd);
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.encryption, EncryptionMode::ChaCha20Poly1305);
        assert_eq!(config.gc_grace_period_hours, 1);
        assert_eq!(config.chunking.min_size, 2048);
        assert_eq!(config.chunking.mask_bits, 12);
        assert_eq!(config.chunking.max_size, 1024 * 1024);
        assert_eq!(config.scrub_interval_hours, 168);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"store_root": "/tmp/bv", "compression": "gzip", "encryption": "aes-256-gcm"}}"#
        )
        .unwrap();

        let config = BackupConfig::from_file(file.path()).unwrap();
        assert_eq!(config.store_root, PathBuf::from("/tmp/bv"));
        assert_eq!(config.compression, CompressionAlgorithm::Gzip);
        assert_eq!(config.encryption, EncryptionMode::Aes256Gcm);
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            BackupConfig::from_file(file.path()),
            Err(DedupError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_file_rejects_invalid_chunking() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[chunking]\nmin_size = 0").unwrap();
        assert!(matches!(
            BackupConfig::from_file(file.path()),
            Err(DedupError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unknown_codec_is_config_error() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "compression = \"brotli\"").unwrap();
        assert!(matches!(
            BackupConfig::from_file(file.path()),
            Err(DedupError::InvalidConfig(_))
        ));
    }
}
