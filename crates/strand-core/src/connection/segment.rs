//! Reliable connection segment format.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic (STRN)                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Acknowledgment Number                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Control    |            Window             |  Payload ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The leading magic lets a channel tell segments apart from anything else
//! before chunk decoding runs. Sequence numbers compare with 32-bit serial
//! arithmetic.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Segment magic number ("STRN")
pub const SEGMENT_MAGIC: u32 = 0x5354_524E;

/// Fixed header length
pub const SEGMENT_HEADER_LEN: usize = 15;

/// Control bits
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Control(u8);

impl Control {
    /// No more data from sender
    pub const FIN: Self = Self(0x01);
    /// Synchronize sequence numbers
    pub const SYN: Self = Self(0x02);
    /// Reset the connection
    pub const RST: Self = Self(0x04);
    /// Last segment of a record
    pub const PSH: Self = Self(0x08);
    /// Acknowledgment field is significant
    pub const ACK: Self = Self(0x10);
    /// Passive side asks the active opener to connect
    pub const REQ: Self = Self(0x20);
    /// Liveness probe; answered with an ACK
    pub const PRB: Self = Self(0x40);

    /// No bits set
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// From raw bits; unknown bits are kept
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// True if every bit of `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Control {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Control {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Control, &str); 7] = [
            (Control::SYN, "SYN"),
            (Control::FIN, "FIN"),
            (Control::RST, "RST"),
            (Control::PSH, "PSH"),
            (Control::ACK, "ACK"),
            (Control::REQ, "REQ"),
            (Control::PRB, "PRB"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", names.join(","))
    }
}

/// `a < b` in sequence space
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space
#[must_use]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// `a > b` in sequence space
#[must_use]
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// `a >= b` in sequence space
#[must_use]
pub fn seq_ge(a: u32, b: u32) -> bool {
    seq_le(b, a)
}

/// One reliable connection segment
#[derive(Clone, PartialEq, Eq)]
pub struct Segment {
    /// Sequence number of the first byte (or of SYN/FIN)
    pub seq: u32,
    /// Next sequence number expected from the peer
    pub ack: u32,
    /// Control bits
    pub ctl: Control,
    /// Advertised receive window
    pub window: u16,
    /// Data bytes
    pub payload: Vec<u8>,
}

impl Segment {
    /// Segment without payload
    #[must_use]
    pub fn control(seq: u32, ack: u32, ctl: Control, window: u16) -> Self {
        Self {
            seq,
            ack,
            ctl,
            window,
            payload: Vec::new(),
        }
    }

    /// Sequence space consumed: payload plus one each for SYN and FIN
    #[must_use]
    pub fn len(&self) -> u32 {
        let mut len = u32::try_from(self.payload.len()).unwrap_or(u32::MAX);
        if self.ctl.contains(Control::SYN) {
            len += 1;
        }
        if self.ctl.contains(Control::FIN) {
            len += 1;
        }
        len
    }

    /// True if the segment consumes no sequence space
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number after this segment
    #[must_use]
    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.len())
    }

    /// Serialize
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SEGMENT_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&SEGMENT_MAGIC.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        buf.push(self.ctl.bits());
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// True if `bytes` carries the segment magic
    #[must_use]
    pub fn is_segment(bytes: &[u8]) -> bool {
        bytes.len() >= SEGMENT_HEADER_LEN
            && u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == SEGMENT_MAGIC
    }

    /// Parse; `None` if the buffer is not a segment
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if !Self::is_segment(bytes) {
            return None;
        }
        let word = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Some(Self {
            seq: word(4),
            ack: word(8),
            ctl: Control::from_bits(bytes[12]),
            window: u16::from_be_bytes([bytes[13], bytes[14]]),
            payload: bytes[SEGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<SEQ={}><ACK={}><CTL={:?}><WND={}><LEN={}>",
            self.seq,
            self.ack,
            self.ctl,
            self.window,
            self.payload.len()
        )
    }
}
