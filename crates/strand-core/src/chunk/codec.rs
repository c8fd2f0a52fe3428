//! Chunk wire format.
//!
//! ```text
//! ┌──────────────┬────────┬───────────────────┬─────────────┐
//! │ magic (u32)  │ id(u8) │ seq/total (1-3 B) │ payload ... │
//! └──────────────┴────────┴───────────────────┴─────────────┘
//! ```
//!
//! All integers are big-endian. Anything that is too short or does not start
//! with one of the two magic numbers is passed through untouched, so chunked
//! and unchunked traffic can share a channel.

use super::{Chunk, SequenceWidth};
use crate::error::{Error, Result};

/// Magic number of a content chunk
pub const MAGIC_CONTENT: u32 = 0xF770_F7CF;

/// Magic number of the last chunk
pub const MAGIC_LAST: u32 = 0xF770_F7D0;

const MAGIC_SIZE: usize = 4;

/// Result of decoding one buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A chunk record
    Chunk(Chunk),
    /// Not a chunk; the original bytes
    PassThrough(Vec<u8>),
}

/// Stateless chunk encoder/decoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkCodec {
    width: SequenceWidth,
}

impl ChunkCodec {
    /// Codec using a `width`-byte sequence field
    #[must_use]
    pub const fn new(width: SequenceWidth) -> Self {
        Self { width }
    }

    /// Sequence field width
    #[must_use]
    pub const fn width(&self) -> SequenceWidth {
        self.width
    }

    /// Header length in bytes
    #[must_use]
    pub const fn header_len(&self) -> usize {
        MAGIC_SIZE + 1 + self.width.bytes()
    }

    /// True if `bytes` starts with a chunk magic number
    #[must_use]
    pub fn is_chunk(bytes: &[u8]) -> bool {
        bytes.len() >= MAGIC_SIZE
            && matches!(
                u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                MAGIC_CONTENT | MAGIC_LAST
            )
    }

    /// Frame a chunk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`] if the sequence (or total) does not
    /// fit the configured field width.
    pub fn encode(&self, chunk: &Chunk) -> Result<Vec<u8>> {
        let (magic, id, field, payload) = match chunk {
            Chunk::Content { id, seq, payload } => (MAGIC_CONTENT, *id, *seq, payload),
            Chunk::Last { id, total, payload } => (MAGIC_LAST, *id, *total, payload),
        };
        if field > self.width.max_value() {
            return Err(Error::FrameTooLarge(format!(
                "chunk field {} exceeds {}-byte width",
                field,
                self.width.bytes()
            )));
        }

        let mut buf = Vec::with_capacity(self.header_len() + payload.len());
        buf.extend_from_slice(&magic.to_be_bytes());
        buf.push(id);
        let field = field.to_be_bytes();
        buf.extend_from_slice(&field[4 - self.width.bytes()..]);
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    /// Parse a buffer, handing back non-chunk input unchanged.
    #[must_use]
    pub fn decode(&self, bytes: Vec<u8>) -> Decoded {
        if bytes.len() < self.header_len() {
            return Decoded::PassThrough(bytes);
        }
        let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != MAGIC_CONTENT && magic != MAGIC_LAST {
            return Decoded::PassThrough(bytes);
        }

        let id = bytes[MAGIC_SIZE];
        let start = MAGIC_SIZE + 1;
        let end = self.header_len();
        let field = bytes[start..end]
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        let payload = bytes[end..].to_vec();

        Decoded::Chunk(if magic == MAGIC_LAST {
            Chunk::Last {
                id,
                total: field,
                payload,
            }
        } else {
            Chunk::Content {
                id,
                seq: field,
                payload,
            }
        })
    }
}
