//! Reassembly of chunked messages.
//!
//! ```text
//!            first chunk                     last + all content chunks
//!   Idle ───────────────────► Collecting ───────────────────────────► Complete
//!    ▲                          │    │                                   │
//!    │       bound violated     │    │ timeout (silent)                  │
//!    └──────────────────────────┴────┴───────────────────────────────────┘
//! ```
//!
//! One message is collected at a time. Every exit from `Collecting` releases
//! the buffered chunks and cancels the timeout before anything is reported.

use super::{Chunk, ChunkConfig};
use crate::error::{Error, Result};
use crate::timer::Timer;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Reassembly state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    /// Nothing buffered
    Idle,
    /// Chunks of one message buffered
    Collecting,
    /// A message was just emitted; behaves like `Idle`
    Complete,
}

/// Collects the chunks of one logical message at a time.
///
/// # Example
///
/// ```
/// use std::time::Instant;
/// use strand_core::chunk::{Chunk, ChunkConfig, ChunkReassemblyBuffer, assemble};
///
/// let mut buffer = ChunkReassemblyBuffer::new(&ChunkConfig::default());
/// let now = Instant::now();
/// assert!(buffer.push(Chunk::Last { id: 1, total: 1, payload: vec![3] }, now).unwrap().is_none());
/// let chunks = buffer
///     .push(Chunk::Content { id: 1, seq: 0, payload: vec![1, 2] }, now)
///     .unwrap()
///     .unwrap();
/// assert_eq!(assemble(chunks), vec![1, 2, 3]);
/// ```
#[derive(Debug)]
pub struct ChunkReassemblyBuffer {
    max_content_length: usize,
    max_chunks: u32,
    timeout: Duration,
    state: ReassemblyState,
    id: u8,
    content: BTreeMap<u32, Vec<u8>>,
    last: Option<(u32, Vec<u8>)>,
    bytes: usize,
    timer: Timer,
}

impl ChunkReassemblyBuffer {
    /// Create an idle buffer with the limits of `config`
    #[must_use]
    pub fn new(config: &ChunkConfig) -> Self {
        Self {
            max_content_length: config.max_content_length,
            max_chunks: config.max_chunks,
            timeout: config.timeout,
            state: ReassemblyState::Idle,
            id: 0,
            content: BTreeMap::new(),
            last: None,
            bytes: 0,
            timer: Timer::new(),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    /// Id of the message being collected
    #[must_use]
    pub fn collecting(&self) -> Option<u8> {
        (self.state == ReassemblyState::Collecting).then_some(self.id)
    }

    /// Bytes currently held
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.bytes
    }

    /// True if nothing is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.last.is_none()
    }

    /// When the pending message times out
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Release everything and return to `Idle`. Safe to call at any time.
    pub fn discard(&mut self) {
        self.timer.cancel();
        self.content.clear();
        self.last = None;
        self.bytes = 0;
        self.state = ReassemblyState::Idle;
    }

    /// Drop the pending message if its timeout elapsed. Returns true if
    /// something was discarded.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        if self.timer.poll_expired(now) {
            tracing::debug!(
                "Dropped incomplete chunked message {} ({} bytes buffered): {}",
                self.id,
                self.bytes,
                Error::ReassemblyTimeout(self.id)
            );
            self.discard();
            return true;
        }
        false
    }

    /// Add a chunk.
    ///
    /// Returns the complete message's chunks in order (content chunks by
    /// ascending sequence, then the last chunk) once all have arrived.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`] if the message exceeds the byte or
    /// chunk-count limit or declares an inconsistent total. The buffer is
    /// empty and idle afterwards.
    pub fn push(&mut self, chunk: Chunk, now: Instant) -> Result<Option<Vec<Chunk>>> {
        self.poll_timeout(now);

        let id = chunk.id();
        if self.state == ReassemblyState::Collecting && id != self.id {
            tracing::debug!(
                "Chunk of message {} replaces incomplete message {}",
                id,
                self.id
            );
            self.discard();
        }
        if self.state != ReassemblyState::Collecting {
            self.state = ReassemblyState::Collecting;
            self.id = id;
            if !self.timeout.is_zero() {
                self.timer.arm(now, self.timeout);
            }
        }

        if let Err(e) = self.accept(chunk) {
            self.discard();
            return Err(e);
        }

        match &self.last {
            Some((total, _)) if *total as usize == self.content.len() => Ok(Some(self.complete())),
            _ => Ok(None),
        }
    }

    fn accept(&mut self, chunk: Chunk) -> Result<()> {
        let len = chunk.payload().len();
        match chunk {
            Chunk::Content { seq, payload, .. } => {
                if seq >= self.max_chunks {
                    return Err(Error::FrameTooLarge(format!(
                        "chunk {} of message {} exceeds {} chunks",
                        seq, self.id, self.max_chunks
                    )));
                }
                if let Some((total, _)) = &self.last {
                    if seq >= *total {
                        return Err(Error::FrameTooLarge(format!(
                            "chunk {} of message {} beyond declared total {}",
                            seq, self.id, total
                        )));
                    }
                }
                if self.content.contains_key(&seq) {
                    tracing::trace!("Duplicate chunk {} of message {}", seq, self.id);
                    return Ok(());
                }
                self.check_length(len)?;
                self.content.insert(seq, payload);
            }
            Chunk::Last { total, payload, .. } => {
                if self.last.is_some() {
                    tracing::trace!("Duplicate last chunk of message {}", self.id);
                    return Ok(());
                }
                if total > self.max_chunks {
                    return Err(Error::FrameTooLarge(format!(
                        "message {} declares {} chunks, limit {}",
                        self.id, total, self.max_chunks
                    )));
                }
                if (total as usize) < self.content.len()
                    || self.content.keys().next_back().is_some_and(|max| *max >= total)
                {
                    return Err(Error::FrameTooLarge(format!(
                        "message {} declares {} chunks but {} are buffered",
                        self.id,
                        total,
                        self.content.len()
                    )));
                }
                self.check_length(len)?;
                self.last = Some((total, payload));
            }
        }
        self.bytes += len;
        Ok(())
    }

    fn check_length(&self, len: usize) -> Result<()> {
        if self.bytes + len > self.max_content_length {
            return Err(Error::FrameTooLarge(format!(
                "message {} exceeds {} bytes",
                self.id, self.max_content_length
            )));
        }
        Ok(())
    }

    fn complete(&mut self) -> Vec<Chunk> {
        self.timer.cancel();
        let id = self.id;
        let mut chunks: Vec<Chunk> = std::mem::take(&mut self.content)
            .into_iter()
            .map(|(seq, payload)| Chunk::Content { id, seq, payload })
            .collect();
        if let Some((total, payload)) = self.last.take() {
            chunks.push(Chunk::Last { id, total, payload });
        }
        self.bytes = 0;
        self.state = ReassemblyState::Complete;
        chunks
    }
}

/// Concatenate the payloads of a complete message
#[must_use]
pub fn assemble(chunks: Vec<Chunk>) -> Vec<u8> {
    let len = chunks.iter().map(|c| c.payload().len()).sum();
    chunks
        .into_iter()
        .fold(Vec::with_capacity(len), |mut out, chunk| {
            out.extend_from_slice(chunk.payload());
            out
        })
}
