//! Sources of the block encryption key.
//!
//! The engine never generates or stores keys. A [`KeyProvider`] hands it
//! key material once when the store is opened.

use std::fmt;
use std::path::PathBuf;

use zeroize::Zeroize;

use crate::encryption::EncryptionKey;
use crate::error::{DedupError, DedupResult};

/// Default environment variable read by [`EnvKeyProvider`].
pub const DEFAULT_KEY_ENV: &str = "BLOCKVAULT_KEY";

/// Supplies the encryption key for a store.
pub trait KeyProvider: Send + Sync {
    /// Return the key, or [`DedupError::MissingKey`] if none is configured.
    fn key(&self) -> DedupResult<EncryptionKey>;
}

/// A key held in memory.
#[derive(Clone)]
pub struct StaticKeyProvider {
    key: EncryptionKey,
}

impl StaticKeyProvider {
    /// Wrap an existing key
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    /// Build from raw material; see [`EncryptionKey::from_slice`].
    pub fn from_bytes(material: &[u8]) -> DedupResult<Self> {
        Ok(Self::new(EncryptionKey::from_slice(material)?))
    }
}

impl fmt::Debug for StaticKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeyProvider").finish_non_exhaustive()
    }
}

impl KeyProvider for StaticKeyProvider {
    fn key(&self) -> DedupResult<EncryptionKey> {
        Ok(self.key.clone())
    }
}

/// Reads a hex-encoded key from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvKeyProvider {
    var: String,
}

impl EnvKeyProvider {
    /// Read from the named variable
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    /// Name of the variable this provider reads
    pub fn var(&self) -> &str {
        &self.var
    }
}

impl Default for EnvKeyProvider {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_ENV)
    }
}

impl KeyProvider for EnvKeyProvider {
    fn key(&self) -> DedupResult<EncryptionKey> {
        let mut value = std::env::var(&self.var).map_err(|_| DedupError::MissingKey)?;
        let key = EncryptionKey::from_hex(&value);
        value.zeroize();
        key
    }
}

/// Reads a key from a file: 64 hex characters (surrounding whitespace
/// ignored), otherwise raw binary key material.
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    /// Read from the given key file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KeyProvider for FileKeyProvider {
    fn key(&self) -> DedupResult<EncryptionKey> {
        let mut material = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DedupError::MissingKey)
            }
            Err(e) => return Err(e.into()),
        };
        let hex_text = std::str::from_utf8(&material)
            .ok()
            .map(str::trim)
            .filter(|t| t.len() == 2 * crate::encryption::KEY_LEN)
            .filter(|t| t.bytes().all(|b| b.is_ascii_hexdigit()));
        let key = match hex_text {
            Some(text) => EncryptionKey::from_hex(text),
            None => EncryptionKey::from_slice(&material),
        };
        material.zeroize();
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_provider_returns_key() {
        let provider = StaticKeyProvider::from_bytes(&[3u8; 40]).unwrap();
        assert_eq!(provider.key().unwrap().0, [3u8; 32]);
        assert!(!format!("{:?}", provider).contains('3'));
    }

    #[test]
    fn test_static_provider_rejects_short_key() {
        assert!(matches!(
            StaticKeyProvider::from_bytes(b"short"),
            Err(DedupError::InvalidKeyLength { len: 5 })
        ));
    }

    #[test]
    fn test_env_provider_missing_var() {
        let provider = EnvKeyProvider::new("BLOCKVAULT_TEST_KEY_THAT_IS_NEVER_SET");
        assert!(matches!(provider.key(), Err(DedupError::MissingKey)));
    }

    #[test]
    fn test_env_provider_reads_hex() {
        let var = "BLOCKVAULT_TEST_KEY_ENV_PROVIDER";
        std::env::set_var(var, "11".repeat(32));
        let key = EnvKeyProvider::new(var).key().unwrap();
        assert_eq!(key.0, [0x11; 32]);
        std::env::remove_var(var);
    }

    #[test]
    fn test_file_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.bin");
        assert!(matches!(
            FileKeyProvider::new(&path).key(),
            Err(DedupError::MissingKey)
        ));
        std::fs::write(&path, [5u8; 32]).unwrap();
        assert_eq!(FileKeyProvider::new(&path).key().unwrap().0, [5u8; 32]);
    }

    #[test]
    fn test_file_provider_decodes_hex_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.hex");
        std::fs::write(&path, format!("{}\n", "ab".repeat(32))).unwrap();
        assert_eq!(FileKeyProvider::new(&path).key().unwrap().0, [0xab; 32]);

        std::fs::write(&path, "AB".repeat(32)).unwrap();
        assert_eq!(FileKeyProvider::new(&path).key().unwrap().0, [0xab; 32]);
    }
}
