//! Outbound chunking.

use super::{Chunk, ChunkCodec, ChunkConfig};
use crate::error::{Error, Result};

/// Splits oversized payloads into framed chunks
#[derive(Debug)]
pub struct ChunkSplitter {
    codec: ChunkCodec,
    max_chunk_payload: usize,
    max_content_length: usize,
    max_chunks: u32,
    next_id: u8,
}

impl ChunkSplitter {
    /// Create a splitter with the limits of `config`
    #[must_use]
    pub fn new(config: &ChunkConfig) -> Self {
        Self {
            codec: ChunkCodec::new(config.sequence_width),
            max_chunk_payload: config.max_chunk_payload.max(1),
            max_content_length: config.max_content_length,
            max_chunks: config.max_chunks,
            next_id: 0,
        }
    }

    /// Codec used for framing
    #[must_use]
    pub fn codec(&self) -> ChunkCodec {
        self.codec
    }

    /// Turn one payload into the records to transmit.
    ///
    /// Small payloads come back as a single untouched record. Larger ones get
    /// a fresh message id and are cut into content chunks plus a last chunk.
    /// A small payload that happens to begin with a chunk magic number is
    /// wrapped in a lone last chunk so the receiver cannot misread it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`] if the payload exceeds the content
    /// length limit or would need more chunks than allowed.
    pub fn split(&mut self, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        if payload.len() > self.max_content_length {
            return Err(Error::FrameTooLarge(format!(
                "payload of {} bytes exceeds {} bytes",
                payload.len(),
                self.max_content_length
            )));
        }
        if payload.len() <= self.max_chunk_payload && !ChunkCodec::is_chunk(payload) {
            return Ok(vec![payload.to_vec()]);
        }

        let pieces: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(self.max_chunk_payload).collect()
        };
        let total = u32::try_from(pieces.len() - 1).unwrap_or(u32::MAX);
        if total > self.max_chunks {
            return Err(Error::FrameTooLarge(format!(
                "payload of {} bytes needs {} chunks, limit {}",
                payload.len(),
                total,
                self.max_chunks
            )));
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let mut records = Vec::with_capacity(pieces.len());
        for (seq, piece) in (0u32..).zip(pieces.iter()) {
            let chunk = if seq == total {
                Chunk::Last {
                    id,
                    total,
                    payload: piece.to_vec(),
                }
            } else {
                Chunk::Content {
                    id,
                    seq,
                    payload: piece.to_vec(),
                }
            };
            records.push(self.codec.encode(&chunk)?);
        }
        tracing::trace!(
            "Split {} bytes into {} chunks (message {})",
            payload.len(),
            records.len(),
            id
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkReassemblyBuffer, Decoded, MAGIC_CONTENT, assemble};
    use std::time::Instant;

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            max_content_length: 64,
            max_chunks: 8,
            max_chunk_payload: 4,
            ..ChunkConfig::default()
        }
    }

    #[test]
    fn test_small_payload_untouched() {
        let mut splitter = ChunkSplitter::new(&small_config());
        assert_eq!(splitter.split(&[1, 2, 3]).unwrap(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_split_and_reassemble() {
        let config = small_config();
        let mut splitter = ChunkSplitter::new(&config);
        let codec = splitter.codec();
        let payload: Vec<u8> = (0..10).collect();

        let records = splitter.split(&payload).unwrap();
        assert_eq!(records.len(), 3);

        let mut buffer = ChunkReassemblyBuffer::new(&config);
        let now = Instant::now();
        let mut result = None;
        for record in records.into_iter().rev() {
            let Decoded::Chunk(chunk) = codec.decode(record) else {
                panic!("expected chunk");
            };
            result = buffer.push(chunk, now).unwrap();
        }
        assert_eq!(assemble(result.unwrap()), payload);
    }

    #[test]
    fn test_ids_wrap() {
        let mut splitter = ChunkSplitter::new(&small_config());
        let codec = splitter.codec();
        let mut ids = Vec::new();
        for _ in 0..257 {
            let records = splitter.split(&[0; 5]).unwrap();
            let Decoded::Chunk(chunk) = codec.decode(records[0].clone()) else {
                panic!("expected chunk");
            };
            ids.push(chunk.id());
        }
        assert_eq!(ids[0], 0);
        assert_eq!(ids[255], 255);
        assert_eq!(ids[256], 0);
    }

    #[test]
    fn test_too_large_rejected() {
        let mut splitter = ChunkSplitter::new(&small_config());
        assert!(matches!(
            splitter.split(&[0; 65]),
            Err(Error::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_too_many_chunks_rejected() {
        let config = ChunkConfig {
            max_content_length: 1024,
            max_chunks: 2,
            max_chunk_payload: 4,
            ..ChunkConfig::default()
        };
        let mut splitter = ChunkSplitter::new(&config);
        // 12 bytes: two content chunks plus last, fits.
        assert_eq!(splitter.split(&[0; 12]).unwrap().len(), 3);
        assert!(matches!(
            splitter.split(&[0; 13]),
            Err(Error::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_magic_lookalike_is_wrapped() {
        let mut splitter = ChunkSplitter::new(&ChunkConfig::default());
        let codec = splitter.codec();
        let payload = MAGIC_CONTENT.to_be_bytes().to_vec();

        let records = splitter.split(&payload).unwrap();
        assert_eq!(records.len(), 1);
        let Decoded::Chunk(chunk) = codec.decode(records[0].clone()) else {
            panic!("expected chunk");
        };
        assert_eq!(
            chunk,
            Chunk::Last {
                id: 0,
                total: 0,
                payload
            }
        );
    }
}
