//! Fixed-size chunking of an async byte stream
//!
//! Chunks are exactly `chunk_size` bytes until the final chunk, which may be
//! shorter and is not padded here. Padding, when a Merkle construction needs
//! it, is the hash layer's concern. The running offset equals the dataset
//! size once EOF is reached.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use crate::manifest::DEFAULT_BLOCK_SIZE;

/// Splits an async reader into fixed-size chunks.
pub struct Chunker<R> {
    reader: R,
    chunk_size: usize,
    offset: u64,
    eof_reached: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    /// Create a chunker with the default block size (64 KiB).
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_BLOCK_SIZE as usize)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be greater than 0");
        Self {
            reader,
            chunk_size,
            offset: 0,
            eof_reached: false,
        }
    }

    /// Read the next chunk.
    ///
    /// Returns `Ok(Some(chunk))` until EOF; the last chunk may be short.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.eof_reached {
            return Ok(None);
        }

        let mut buffer = vec![0u8; self.chunk_size];
        let mut total_read = 0;

        while total_read < self.chunk_size {
            match self.reader.read(&mut buffer[total_read..]).await? {
                0 => {
                    self.eof_reached = true;
                    if total_read == 0 {
                        return Ok(None);
                    }
                    buffer.truncate(total_read);
                    self.offset += total_read as u64;
                    return Ok(Some(buffer));
                }
                n => total_read += n,
            }
        }

        self.offset += total_read as u64;
        Ok(Some(buffer))
    }
}

impl<R> Chunker<R> {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Cumulative bytes consumed; equals the dataset size at EOF.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_eof(&self) -> bool {
        self.eof_reached
    }
}
