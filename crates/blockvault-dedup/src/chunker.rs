//! Content-defined chunking over a rolling hash
//!
//! A boundary is cut once the current chunk holds at least `min_size` bytes
//! and either the low `mask_bits` bits of the rolling hash are zero or the
//! chunk has reached `max_size`. Expected chunk length is `2^mask_bits`.

use std::io::{self, Read};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{DedupError, DedupResult};
use crate::rolling_hash::RollingHash;

/// Size of each read from the underlying source.
const READ_BUF_SIZE: usize = 64 * 1024;

/// A content-defined chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk content
    pub data: Bytes,
    /// Byte offset of this chunk in the original stream
    pub offset: u64,
}

impl Chunk {
    /// Length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length chunk (never produced by the chunker)
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Configuration for the content-defined chunker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Minimum chunk size in bytes
    pub min_size: usize,
    /// Nominal average size. Informational only: `mask_bits` controls it.
    pub avg_size: usize,
    /// Maximum chunk size in bytes
    pub max_size: usize,
    /// Rolling hash window in bytes
    pub window_size: usize,
    /// Number of low hash bits that must be zero at a boundary
    pub mask_bits: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 4 * 1024,
            avg_size: 64 * 1024,
            max_size: 1024 * 1024,
            window_size: 48,
            mask_bits: 16,
        }
    }
}

impl ChunkerConfig {
    /// Reject parameter combinations the chunker cannot honour.
    pub fn validate(&self) -> DedupResult<()> {
        if self.min_size == 0 {
            return Err(DedupError::InvalidConfig(
                "chunking.min_size must be greater than 0".into(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(DedupError::InvalidConfig(format!(
                "chunking.min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.window_size == 0 {
            return Err(DedupError::InvalidConfig(
                "chunking.window_size must be greater than 0".into(),
            ));
        }
        if !(1..=31).contains(&self.mask_bits) {
            return Err(DedupError::InvalidConfig(format!(
                "chunking.mask_bits must be in 1..=31, got {}",
                self.mask_bits
            )));
        }
        Ok(())
    }

    /// Boundary mask with exactly `mask_bits` low bits set.
    pub fn mask(&self) -> u32 {
        (1u32 << self.mask_bits) - 1
    }
}

/// Splits byte streams into content-defined chunks.
#[derive(Debug, Clone, Default)]
pub struct ContentDefinedChunker {
    config: ChunkerConfig,
}

impl ContentDefinedChunker {
    /// Create a chunker with the given configuration
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Chunker configuration
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Lazily chunk a reader. The stream is consumed as chunks are pulled.
    pub fn chunk_reader<R: Read>(&self, reader: R) -> ChunkStream<R> {
        ChunkStream::new(reader, &self.config)
    }

    /// Chunk an in-memory buffer.
    /// Concatenating all chunk.data bytes reconstructs the original data.
    pub fn chunk_bytes(&self, data: &[u8]) -> Vec<Chunk> {
        self.chunk_reader(data)
            .collect::<io::Result<Vec<_>>>()
            .unwrap_or_default()
    }
}

/// Lazy, finite, non-restartable sequence of chunks read from `R`.
pub struct ChunkStream<R> {
    reader: R,
    rolling: RollingHash,
    min_size: usize,
    max_size: usize,
    mask: u32,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
    current: Vec<u8>,
    offset: u64,
    eof: bool,
}

impl<R: Read> ChunkStream<R> {
    fn new(reader: R, config: &ChunkerConfig) -> Self {
        Self {
            reader,
            rolling: RollingHash::new(config.window_size),
            min_size: config.min_size.max(1),
            max_size: config.max_size.max(config.min_size.max(1)),
            mask: config.mask(),
            buf: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
            pos: 0,
            filled: 0,
            current: Vec::new(),
            offset: 0,
            eof: false,
        }
    }

    fn emit(&mut self) -> Chunk {
        let data = Bytes::from(std::mem::take(&mut self.current));
        let chunk = Chunk {
            offset: self.offset,
            data,
        };
        self.offset += chunk.data.len() as u64;
        self.rolling.reset();
        chunk
    }

    fn fill(&mut self) -> io::Result<()> {
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.pos = 0;
                    self.filled = n;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pos == self.filled {
                if self.eof {
                    return (!self.current.is_empty()).then(|| Ok(self.emit()));
                }
                if let Err(e) = self.fill() {
                    self.eof = true;
                    self.current.clear();
                    return Some(Err(e));
                }
                continue;
            }

            while self.pos < self.filled {
                let byte = self.buf[self.pos];
                self.pos += 1;
                self.current.push(byte);
                let h = self.rolling.update(byte);

                let len = self.current.len();
                if len >= self.min_size && (h & self.mask == 0 || len >= self.max_size) {
                    return Some(Ok(self.emit()));
                }
            }
        }
    }
}
