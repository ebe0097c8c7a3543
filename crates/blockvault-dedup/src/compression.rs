//! LZ4, Zstd and Gzip compression for stored blocks
//!
//! Compression is best effort: a codec compiled out of this build degrades to
//! storing the block uncompressed. Decompression always dispatches on the tag
//! recorded with the block, never on the store's current default.

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DedupError, DedupResult};

/// Read size used by [`decompress_stream`].
pub const STREAM_READ_SIZE: usize = 64 * 1024;

/// Compression algorithm selection. Serialized as the on-disk tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression (passthrough)
    None,
    /// LZ4 frame format, the fast default
    #[default]
    Lz4,
    /// Zstandard frame, higher ratio
    Zstd,
    /// Gzip (deflate)
    Gzip,
}

impl CompressionAlgorithm {
    /// The on-disk tag for this algorithm
    pub fn tag(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::Gzip => "gzip",
        }
    }

    /// Whether the codec is compiled into this build
    pub fn is_available(&self) -> bool {
        match self {
            CompressionAlgorithm::None => true,
            CompressionAlgorithm::Lz4 => cfg!(feature = "lz4"),
            CompressionAlgorithm::Zstd => cfg!(feature = "zstd"),
            CompressionAlgorithm::Gzip => cfg!(feature = "gzip"),
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Compress data with the requested algorithm.
///
/// Returns the payload and the tag actually used, which is `None` when the
/// requested codec is unavailable.
pub fn compress(
    data: &[u8],
    algo: CompressionAlgorithm,
    level: i32,
) -> DedupResult<(Vec<u8>, CompressionAlgorithm)> {
    let compressed = match algo {
        CompressionAlgorithm::None => return Ok((data.to_vec(), CompressionAlgorithm::None)),
        CompressionAlgorithm::Lz4 => codec::lz4_compress(data)?,
        CompressionAlgorithm::Zstd => codec::zstd_compress(data, level)?,
        CompressionAlgorithm::Gzip => codec::gzip_compress(data, level)?,
    };
    match compressed {
        Some(payload) => Ok((payload, algo)),
        None => {
            warn!(algorithm = %algo, "compression not available, storing uncompressed");
            Ok((data.to_vec(), CompressionAlgorithm::None))
        }
    }
}

/// Decompress a payload produced with `algo`.
pub fn decompress(data: &[u8], algo: CompressionAlgorithm) -> DedupResult<Vec<u8>> {
    if algo == CompressionAlgorithm::None {
        return Ok(data.to_vec());
    }
    let mut out = Vec::with_capacity(data.len().saturating_mul(2));
    decompress_reader(data, algo)?
        .read_to_end(&mut out)
        .map_err(|e| DedupError::DecompressionFailed(e.to_string()))?;
    Ok(out)
}

/// Wrap `source` in a decoder for `algo`.
pub fn decompress_reader<'a, R: Read + 'a>(
    source: R,
    algo: CompressionAlgorithm,
) -> DedupResult<Box<dyn Read + 'a>> {
    let reader = match algo {
        CompressionAlgorithm::None => Some(Box::new(source) as Box<dyn Read + 'a>),
        CompressionAlgorithm::Lz4 => codec::lz4_reader(source),
        CompressionAlgorithm::Zstd => codec::zstd_reader(source)?,
        CompressionAlgorithm::Gzip => codec::gzip_reader(source),
    };
    reader.ok_or(DedupError::CompressionUnavailable { algorithm: algo })
}

/// Stream-decompress `source` in fixed reads of [`STREAM_READ_SIZE`] bytes
/// until exhausted. Memory use is bounded by the read size and the codec's
/// window, not by the payload size.
pub fn decompress_stream<'a, R: Read + 'a>(
    source: R,
    algo: CompressionAlgorithm,
) -> DedupResult<DecompressStream<'a>> {
    Ok(DecompressStream {
        reader: decompress_reader(source, algo)?,
        buf: vec![0u8; STREAM_READ_SIZE],
        done: false,
    })
}

/// Iterator of decompressed pieces, see [`decompress_stream`].
pub struct DecompressStream<'a> {
    reader: Box<dyn Read + 'a>,
    buf: Vec<u8>,
    done: bool,
}

impl Iterator for DecompressStream<'_> {
    type Item = DedupResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => return Some(Ok(self.buf[..n].to_vec())),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(DedupError::DecompressionFailed(e.to_string())));
                }
            }
        }
    }
}

/// Per-codec implementations; each returns `None` when compiled out.
mod codec {
    use std::io::Read;

    use crate::error::DedupResult;

    #[cfg(feature = "lz4")]
    pub(super) fn lz4_compress(data: &[u8]) -> DedupResult<Option<Vec<u8>>> {
        use crate::error::DedupError;
        use std::io::Write;

        let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::with_capacity(data.len() / 2 + 64));
        enc.write_all(data)
            .map_err(|e| DedupError::CompressionFailed(e.to_string()))?;
        enc.finish()
            .map(Some)
            .map_err(|e| DedupError::CompressionFailed(e.to_string()))
    }

    #[cfg(not(feature = "lz4"))]
    pub(super) fn lz4_compress(_data: &[u8]) -> DedupResult<Option<Vec<u8>>> {
        Ok(None)
    }

    #[cfg(feature = "lz4")]
    pub(super) fn lz4_reader<'a, R: Read + 'a>(source: R) -> Option<Box<dyn Read + 'a>> {
        Some(Box::new(lz4_flex::frame::FrameDecoder::new(source)))
    }

    #[cfg(not(feature = "lz4"))]
    pub(super) fn lz4_reader<'a, R: Read + 'a>(_source: R) -> Option<Box<dyn Read + 'a>> {
        None
    }

    #[cfg(feature = "zstd")]
    pub(super) fn zstd_compress(data: &[u8], level: i32) -> DedupResult<Option<Vec<u8>>> {
        use crate::error::DedupError;

        zstd::encode_all(data, level)
            .map(Some)
            .map_err(|e| DedupError::CompressionFailed(e.to_string()))
    }

    #[cfg(not(feature = "zstd"))]
    pub(super) fn zstd_compress(_data: &[u8], _level: i32) -> DedupResult<Option<Vec<u8>>> {
        Ok(None)
    }

    #[cfg(feature = "zstd")]
    pub(super) fn zstd_reader<'a, R: Read + 'a>(
        source: R,
    ) -> DedupResult<Option<Box<dyn Read + 'a>>> {
        use crate::error::DedupError;

        let decoder = zstd::stream::read::Decoder::new(source)
            .map_err(|e| DedupError::DecompressionFailed(e.to_string()))?;
        Ok(Some(Box::new(decoder)))
    }

    #[cfg(not(feature = "zstd"))]
    pub(super) fn zstd_reader<'a, R: Read + 'a>(
        _source: R,
    ) -> DedupResult<Option<Box<dyn Read + 'a>>> {
        Ok(None)
    }

    #[cfg(feature = "gzip")]
    pub(super) fn gzip_compress(data: &[u8], level: i32) -> DedupResult<Option<Vec<u8>>> {
        use crate::error::DedupError;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let level = flate2::Compression::new(level.clamp(0, 9) as u32);
        let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), level);
        enc.write_all(data)
            .map_err(|e| DedupError::CompressionFailed(e.to_string()))?;
        enc.finish()
            .map(Some)
            .map_err(|e| DedupError::CompressionFailed(e.to_string()))
    }

    #[cfg(not(feature = "gzip"))]
    pub(super) fn gzip_compress(_data: &[u8], _level: i32) -> DedupResult<Option<Vec<u8>>> {
        Ok(None)
    }

    #[cfg(feature = "gzip")]
    pub(super) fn gzip_reader<'a, R: Read + 'a>(source: R) -> Option<Box<dyn Read + 'a>> {
        Some(Box::new(flate2::read::GzDecoder::new(source)))
    }

    #[cfg(not(feature = "gzip"))]
    pub(super) fn gzip_reader<'a, R: Read + 'a>(_source: R) -> Option<Box<dyn Read + 'a>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [CompressionAlgorithm; 4] = [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Zstd,
        CompressionAlgorithm::Gzip,
    ];

    proptest! {
        #[test]
        fn test_prop_roundtrip_all_codecs(data in prop::collection::vec(any::<u8>(), 0..100_000)) {
            for algo in ALL {
                let (c, used) = compress(&data, algo, 3).unwrap();
                let d = decompress(&c, used).unwrap();
                prop_assert_eq!(&d, &data);
            }
        }
    }

    #[test]
    fn test_empty_roundtrips() {
        for algo in ALL {
            let (c, used) = compress(&[], algo, 3).unwrap();
            assert_eq!(decompress(&c, used).unwrap(), b"");
        }
    }

    #[test]
    fn test_repetitive_data_shrinks() {
        let data = b"A".repeat(100_000);
        for algo in [
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Gzip,
        ] {
            let (c, used) = compress(&data, algo, 3).unwrap();
            assert_eq!(used, algo);
            assert!(c.len() < data.len() / 10, "{} produced {} bytes", algo, c.len());
        }
    }

    #[test]
    fn test_gzip_level_is_clamped() {
        let data = b"hello hello hello hello".repeat(100);
        let (c, used) = compress(&data, CompressionAlgorithm::Gzip, 22).unwrap();
        assert_eq!(used, CompressionAlgorithm::Gzip);
        assert_eq!(decompress(&c, used).unwrap(), data);
    }

    #[test]
    fn test_decompress_with_wrong_tag_fails() {
        let data = b"some data that is definitely not a zstd frame".repeat(10);
        let (c, _) = compress(&data, CompressionAlgorithm::Lz4, 3).unwrap();
        assert!(matches!(
            decompress(&c, CompressionAlgorithm::Zstd),
            Err(DedupError::DecompressionFailed(_))
        ));
    }

    #[test]
    fn test_stream_matches_one_shot() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        for algo in ALL {
            let (c, used) = compress(&data, algo, 3).unwrap();
            let mut streamed = Vec::new();
            for piece in decompress_stream(&c[..], used).unwrap() {
                let piece = piece.unwrap();
                assert!(piece.len() <= STREAM_READ_SIZE);
                streamed.extend_from_slice(&piece);
            }
            assert_eq!(streamed, data, "{}", algo);
        }
    }

    #[test]
    fn test_stream_reports_corruption() {
        let data = b"x".repeat(10_000);
        let (mut c, used) = compress(&data, CompressionAlgorithm::Gzip, 6).unwrap();
        let mid = c.len() / 2;
        c[mid] ^= 0xff;
        c.truncate(c.len() - 4);
        let result: DedupResult<Vec<Vec<u8>>> = decompress_stream(&c[..], used).unwrap().collect();
        assert!(result.is_err());
    }

    #[test]
    fn test_tags_serialize_lowercase() {
        for (algo, tag) in [
            (CompressionAlgorithm::None, "\"none\""),
            (CompressionAlgorithm::Lz4, "\"lz4\""),
            (CompressionAlgorithm::Zstd, "\"zstd\""),
            (CompressionAlgorithm::Gzip, "\"gzip\""),
        ] {
            assert_eq!(serde_json::to_string(&algo).unwrap(), tag);
            assert_eq!(serde_json::from_str::<CompressionAlgorithm>(tag).unwrap(), algo);
        }
        assert!(serde_json::from_str::<CompressionAlgorithm>("\"brotli\"").is_err());
    }

    #[test]
    fn test_default_build_has_all_codecs() {
        assert!(ALL.iter().all(|a| a.is_available()));
    }
}
