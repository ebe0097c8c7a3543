//! Error types for the blockvault-dedup engine

use std::path::PathBuf;

use crate::compression::CompressionAlgorithm;
use crate::digest::BlockDigest;

/// Result type alias for engine operations.
pub type DedupResult<T> = Result<T, DedupError>;

/// All errors that can occur in the backup engine.
///
/// Integrity failures found by a scrub and refused block deletions are not
/// errors; they are reported through `ScrubResult` and a zero return value.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// The file or path to back up does not exist
    #[error("Source not found: {}", path.display())]
    SourceNotFound {
        /// Path that was requested
        path: PathBuf,
    },
    /// No manifest with this id
    #[error("Backup not found: {id}")]
    BackupNotFound {
        /// Manifest id that was requested
        id: String,
    },
    /// Digest is not present in the block index
    #[error("Block {digest} not in index")]
    BlockNotFound {
        /// Digest that was requested
        digest: BlockDigest,
    },
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression operation failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// Block was stored with a codec this build does not include
    #[error("Compression algorithm {algorithm} is not available in this build")]
    CompressionUnavailable {
        /// The stored codec tag
        algorithm: CompressionAlgorithm,
    },
    /// Encryption was requested but this build has no AEAD support
    #[error("Encryption requested but this build was compiled without the `encryption` feature")]
    EncryptionUnavailable,
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Decryption authentication tag mismatch: data corrupted or tampered with
    #[error("Decryption failed: authentication tag mismatch (data may be corrupted)")]
    DecryptionAuthFailed,
    /// Stored payload is shorter than the nonce it must start with
    #[error("Ciphertext too short: {len} bytes")]
    TruncatedCiphertext {
        /// Length of the payload that was read
        len: usize,
    },
    /// Encryption is enabled but no key was supplied
    #[error("Missing encryption key: encryption is enabled but no key was provided")]
    MissingKey,
    /// Supplied key material is shorter than 256 bits
    #[error("Invalid key length: {len} bytes (need at least 32)")]
    InvalidKeyLength {
        /// Number of bytes supplied
        len: usize,
    },
    /// A persisted index file exists but cannot be parsed
    #[error("Index {} is corrupted: {reason}", path.display())]
    IndexCorrupted {
        /// Index file path
        path: PathBuf,
        /// Parser error
        reason: String,
    },
    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DedupError {
    /// True when the error means a block's backing file is gone.
    pub fn is_missing_file(&self) -> bool {
        matches!(self, DedupError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
