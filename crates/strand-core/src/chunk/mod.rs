//! Message chunking and reassembly.
//!
//! Application payloads larger than one datagram are split into chunks by
//! the [`ChunkSplitter`], framed by the [`ChunkCodec`] and put back together
//! on the receiving side by a [`ChunkReassemblyBuffer`].
//!
//! ```text
//! payload (3000 B, max_chunk_payload 1200)
//!   ├─► Content { id 7, seq 0 }  1200 B
//!   ├─► Content { id 7, seq 1 }  1200 B
//!   └─► Last    { id 7, total 2 } 600 B
//! ```
//!
//! The last chunk carries the number of content chunks before it instead of
//! a sequence number.

mod codec;
mod reassembly;
mod splitter;

pub use codec::{ChunkCodec, Decoded, MAGIC_CONTENT, MAGIC_LAST};
pub use reassembly::{ChunkReassemblyBuffer, ReassemblyState, assemble};
pub use splitter::ChunkSplitter;

use std::time::Duration;

/// Width of the sequence/count field on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceWidth {
    /// One byte, up to 255
    One,
    /// Two bytes, up to 65 535
    #[default]
    Two,
    /// Three bytes, up to 16 777 215
    Three,
}

impl SequenceWidth {
    /// Width from a byte count (1, 2 or 3)
    #[must_use]
    pub const fn from_bytes(bytes: u8) -> Option<Self> {
        match bytes {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            3 => Some(Self::Three),
            _ => None,
        }
    }

    /// Field size in bytes
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
        }
    }

    /// Largest value the field can hold
    #[must_use]
    pub const fn max_value(self) -> u32 {
        match self {
            Self::One => 0xFF,
            Self::Two => 0xFFFF,
            Self::Three => 0x00FF_FFFF,
        }
    }
}

/// Chunking limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Largest reassembled message in bytes
    pub max_content_length: usize,
    /// Largest number of content chunks per message
    pub max_chunks: u32,
    /// Payload bytes per chunk; smaller messages are not chunked
    pub max_chunk_payload: usize,
    /// Wire width of the sequence field
    pub sequence_width: SequenceWidth,
    /// Reassembly timeout; zero disables it
    pub timeout: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_content_length: 1 << 20,
            max_chunks: 1 << 12,
            max_chunk_payload: 1200,
            sequence_width: SequenceWidth::Two,
            timeout: Duration::from_secs(15),
        }
    }
}

impl ChunkConfig {
    /// Check the limits are consistent.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistent field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_chunk_payload == 0 {
            return Err("max_chunk_payload must be positive".into());
        }
        if self.max_chunks == 0 {
            return Err("max_chunks must be positive".into());
        }
        if self.max_chunks > self.sequence_width.max_value() {
            return Err(format!(
                "max_chunks {} does not fit a {}-byte sequence field",
                self.max_chunks,
                self.sequence_width.bytes()
            ));
        }
        if self.max_content_length < self.max_chunk_payload {
            return Err("max_content_length is smaller than max_chunk_payload".into());
        }
        Ok(())
    }
}

/// One framed fragment of a logical message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Content chunk at position `seq`
    Content {
        /// Logical message id
        id: u8,
        /// Position within the message, from 0
        seq: u32,
        /// Fragment bytes
        payload: Vec<u8>,
    },
    /// Final chunk; `total` is the number of content chunks before it
    Last {
        /// Logical message id
        id: u8,
        /// Count of preceding content chunks
        total: u32,
        /// Fragment bytes
        payload: Vec<u8>,
    },
}

impl Chunk {
    /// Logical message id
    #[must_use]
    pub fn id(&self) -> u8 {
        match self {
            Self::Content { id, .. } | Self::Last { id, .. } => *id,
        }
    }

    /// Fragment bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Content { payload, .. } | Self::Last { payload, .. } => payload,
        }
    }

    /// Consume into the fragment bytes
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Self::Content { payload, .. } | Self::Last { payload, .. } => payload,
        }
    }

    /// True for the final chunk
    #[must_use]
    pub fn is_last(&self) -> bool {
        matches!(self, Self::Last { .. })
    }
}
