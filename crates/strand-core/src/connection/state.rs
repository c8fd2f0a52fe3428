//! Connection states.
//!
//! ```text
//!                      open (active)                 SYN,ACK / send ACK
//!   Closed ──────────────────────────► SynSent ─────────────────────────┐
//!     │                                                                 ▼
//!     │ open (passive)        SYN / send SYN,ACK          ACK      Established
//!     └──────────► Listen ──────────────────────► SynReceived ─────────►│
//!                                                                       │
//!              ┌───────────── close / send FIN ─────────────────────────┤
//!              ▼                                                        │ FIN / ACK, send FIN
//!          FinWait1 ──ACK──► FinWait2 ──FIN──┐                          ▼
//!              │                             ▼                       LastAck ──ACK──► Closed
//!              └───FIN───► Closing ──ACK──► TimeWait ──2*MSL──► Closed
//! ```
//!
//! A FIN from the peer is confirmed and answered right away, so `CloseWait`
//! only lasts until the queued data and the local FIN are on the wire.

use std::fmt;

/// Reliable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection
    #[default]
    Closed,
    /// Passive side waiting for a SYN
    Listen,
    /// SYN sent, waiting for SYN,ACK
    SynSent,
    /// SYN received and answered, waiting for ACK
    SynReceived,
    /// Handshake complete
    Established,
    /// Local FIN sent, waiting for its ACK
    FinWait1,
    /// Local FIN acknowledged, waiting for the peer's FIN
    FinWait2,
    /// Peer closed; local FIN not yet sent
    CloseWait,
    /// Both sides sent FIN simultaneously
    Closing,
    /// Peer closed first; waiting for the ACK of the local FIN
    LastAck,
    /// Both directions closed; absorbing late segments
    TimeWait,
}

impl ConnectionState {
    /// True once sequence numbers of both sides are known
    #[must_use]
    pub fn is_synchronized(self) -> bool {
        !matches!(
            self,
            Self::Closed | Self::Listen | Self::SynSent | Self::SynReceived
        )
    }

    /// True while the handshake is in progress
    #[must_use]
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::Listen | Self::SynSent | Self::SynReceived)
    }

    /// True if `write` is still accepted
    #[must_use]
    pub fn accepts_writes(self) -> bool {
        matches!(
            self,
            Self::Listen | Self::SynSent | Self::SynReceived | Self::Established
        )
    }

    /// True if the peer may still send data
    #[must_use]
    pub fn accepts_data(self) -> bool {
        matches!(self, Self::Established | Self::FinWait1 | Self::FinWait2)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN-SENT",
            Self::SynReceived => "SYN-RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN-WAIT-1",
            Self::FinWait2 => "FIN-WAIT-2",
            Self::CloseWait => "CLOSE-WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST-ACK",
            Self::TimeWait => "TIME-WAIT",
        };
        f.write_str(name)
    }
}
