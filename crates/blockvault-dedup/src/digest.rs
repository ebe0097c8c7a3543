//! Content addressing: SHA-256 digests of plaintext blocks

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 hash of a block's plaintext. Used as the CAS key.
///
/// Serialized as a lowercase hex string, which is also the on-disk file name
/// and the key of the block index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockDigest(pub [u8; 32]);

impl BlockDigest {
    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Path of the block file relative to the blocks directory:
    /// `hex[0:2]/hex[2:4]/hex`.
    pub fn shard_path(&self) -> PathBuf {
        let hex = self.to_hex();
        let mut path = PathBuf::from(&hex[0..2]);
        path.push(&hex[2..4]);
        path.push(&hex);
        path
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

/// Compute the SHA-256 digest of data
pub fn sha256_digest(data: &[u8]) -> BlockDigest {
    BlockDigest(Sha256::digest(data).into())
}

impl fmt::Display for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockDigest({})", self.to_hex())
    }
}

/// Error parsing a digest from its hex form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid block digest {input:?}: expected 64 hex characters")]
pub struct ParseDigestError {
    input: String,
}

impl FromStr for BlockDigest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseDigestError {
            input: s.to_string(),
        })?;
        Ok(BlockDigest(bytes))
    }
}

impl Serialize for BlockDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

struct DigestVisitor;

impl<'de> Visitor<'de> for DigestVisitor {
    type Value = BlockDigest;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a 64-character hex SHA-256 digest")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for BlockDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(DigestVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sha256_known_vector() {
        let d = sha256_digest(b"abc");
        assert_eq!(
            d.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_different_data_produces_different_digests() {
        assert_ne!(sha256_digest(b"hello"), sha256_digest(b"world"));
    }

    #[test]
    fn test_shard_path_layout() {
        let d = sha256_digest(b"abc");
        assert_eq!(
            d.shard_path(),
            PathBuf::from("ba/78/ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("xyz".parse::<BlockDigest>().is_err());
        assert!("ab".repeat(31).parse::<BlockDigest>().is_err());
    }

    #[test]
    fn test_serde_as_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(sha256_digest(b"k"), 7u32);
        let json = serde_json::to_string(&map).unwrap();
        assert!(json.starts_with("{\""));
        let back: std::collections::BTreeMap<BlockDigest, u32> =
            serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    proptest! {
        #[test]
        fn test_prop_hex_parse_inverse(bytes in prop::array::uniform32(any::<u8>())) {
            let d = BlockDigest(bytes);
            prop_assert_eq!(d.to_hex().parse::<BlockDigest>().unwrap(), d);
        }
    }
}
