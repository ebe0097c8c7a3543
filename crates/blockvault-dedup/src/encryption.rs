//! AES-256-GCM and ChaCha20-Poly1305 AEAD encryption of stored blocks
//!
//! Stored layout is `nonce (12 bytes) || ciphertext+tag`. A fresh random
//! nonce is drawn for every encryption.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{DedupError, DedupResult};

/// Length of the nonce prefix on every encrypted payload.
pub const NONCE_LEN: usize = 12;

/// Length of the key in bytes.
pub const KEY_LEN: usize = 32;

/// 256-bit (32-byte) encryption key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; KEY_LEN]);

impl EncryptionKey {
    /// Build a key from raw material. The first 32 bytes are used; shorter
    /// input is rejected.
    pub fn from_slice(material: &[u8]) -> DedupResult<Self> {
        if material.len() < KEY_LEN {
            return Err(DedupError::InvalidKeyLength {
                len: material.len(),
            });
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&material[..KEY_LEN]);
        Ok(EncryptionKey(key))
    }

    /// Parse a key from hex. Same length rules as [`EncryptionKey::from_slice`].
    pub fn from_hex(s: &str) -> DedupResult<Self> {
        let mut material = hex::decode(s.trim()).map_err(|e| {
            DedupError::InvalidConfig(format!("encryption key is not valid hex: {}", e))
        })?;
        let key = Self::from_slice(&material);
        material.zeroize();
        key
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// Block encryption mode. Serialized as the on-disk tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EncryptionMode {
    /// Store blocks in the clear
    #[default]
    #[serde(rename = "none")]
    None,
    /// AES-256-GCM, hardware accelerated on x86 with AES-NI
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    /// ChaCha20-Poly1305, constant-time and fast without AES-NI
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl EncryptionMode {
    /// The on-disk tag for this mode
    pub fn tag(&self) -> &'static str {
        match self {
            EncryptionMode::None => "none",
            EncryptionMode::Aes256Gcm => "aes-256-gcm",
            EncryptionMode::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    /// True for any mode other than [`EncryptionMode::None`]
    pub fn is_enabled(&self) -> bool {
        *self != EncryptionMode::None
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Encrypt plaintext under `mode`. Returns `nonce || ciphertext`.
/// [`EncryptionMode::None`] returns the plaintext unchanged.
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey, mode: EncryptionMode) -> DedupResult<Vec<u8>> {
    match mode {
        EncryptionMode::None => Ok(plaintext.to_vec()),
        _ => aead::seal(plaintext, key, mode),
    }
}

/// Decrypt a `nonce || ciphertext` payload.
///
/// Returns [`DedupError::DecryptionAuthFailed`] if the payload was tampered
/// with or the key is wrong.
pub fn decrypt(payload: &[u8], key: &EncryptionKey, mode: EncryptionMode) -> DedupResult<Vec<u8>> {
    if mode == EncryptionMode::None {
        return Ok(payload.to_vec());
    }
    if payload.len() < NONCE_LEN {
        return Err(DedupError::TruncatedCiphertext { len: payload.len() });
    }
    aead::open(payload, key, mode)
}

#[cfg(feature = "encryption")]
mod aead {
    use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
    use chacha20poly1305::ChaCha20Poly1305;
    use rand::RngCore;

    use super::{EncryptionKey, EncryptionMode, NONCE_LEN};
    use crate::error::{DedupError, DedupResult};

    fn random_nonce() -> [u8; NONCE_LEN] {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }

    pub(super) fn seal(
        plaintext: &[u8],
        key: &EncryptionKey,
        mode: EncryptionMode,
    ) -> DedupResult<Vec<u8>> {
        let nonce = random_nonce();
        let ciphertext = match mode {
            EncryptionMode::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&key.0)
                    .map_err(|e| DedupError::EncryptionFailed(e.to_string()))?;
                cipher
                    .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                    .map_err(|e| DedupError::EncryptionFailed(e.to_string()))?
            }
            EncryptionMode::ChaCha20Poly1305 => {
                use chacha20poly1305::aead::Aead as _;
                use chacha20poly1305::KeyInit as _;
                let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                    .map_err(|e| DedupError::EncryptionFailed(e.to_string()))?;
                cipher
                    .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
                    .map_err(|e| DedupError::EncryptionFailed(e.to_string()))?
            }
            EncryptionMode::None => return Ok(plaintext.to_vec()),
        };
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub(super) fn open(
        payload: &[u8],
        key: &EncryptionKey,
        mode: EncryptionMode,
    ) -> DedupResult<Vec<u8>> {
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        match mode {
            EncryptionMode::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&key.0)
                    .map_err(|e| DedupError::EncryptionFailed(e.to_string()))?;
                cipher
                    .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
                    .map_err(|_| DedupError::DecryptionAuthFailed)
            }
            EncryptionMode::ChaCha20Poly1305 => {
                use chacha20poly1305::aead::Aead as _;
                use chacha20poly1305::KeyInit as _;
                let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                    .map_err(|e| DedupError::EncryptionFailed(e.to_string()))?;
                cipher
                    .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
                    .map_err(|_| DedupError::DecryptionAuthFailed)
            }
            EncryptionMode::None => Ok(payload.to_vec()),
        }
    }
}

#[cfg(not(feature = "encryption"))]
mod aead {
    use super::{EncryptionKey, EncryptionMode};
    use crate::error::{DedupError, DedupResult};

    pub(super) fn seal(_: &[u8], _: &EncryptionKey, _: EncryptionMode) -> DedupResult<Vec<u8>> {
        Err(DedupError::EncryptionUnavailable)
    }

    pub(super) fn open(_: &[u8], _: &EncryptionKey, _: EncryptionMode) -> DedupResult<Vec<u8>> {
        Err(DedupError::EncryptionUnavailable)
    }
}
