//! Error types for the strand transport core.
//!
//! [`Error`] is the closed set of failures the core reports. Most of them are
//! contained to one channel: they are logged and surfaced to the application
//! as an event, and never touch the shared path registry or other channels.
//! Only [`Error::SuperPeerUnreachable`] during startup aborts the node.

use std::time::Duration;
use strand_crypto::CryptoError;
use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Chunked message exceeded a size or chunk-count bound
    #[error("frame too large: {0}")]
    FrameTooLarge(String),

    /// Chunked message was not completed in time
    #[error("reassembly of message {0} timed out")]
    ReassemblyTimeout(u8),

    /// Remote side never answered the handshake
    #[error("handshake timed out after {attempts} attempts")]
    HandshakeTimeout {
        /// SYN (or open request) transmissions made
        attempts: u32,
    },

    /// Remote side reset the handshake
    #[error("handshake rejected by remote peer")]
    HandshakeRejected,

    /// A segment was never acknowledged
    #[error("retransmission exhausted after {attempts} attempts")]
    RetransmissionExhausted {
        /// Transmissions of the oldest unacknowledged segment
        attempts: u32,
    },

    /// Idle probes went unanswered
    #[error("peer unreachable: {probes} probes unanswered")]
    PeerUnreachable {
        /// Probes sent without response
        probes: u32,
    },

    /// No super peer confirmed registration during startup
    #[error("no super peer reachable within {0:?}")]
    SuperPeerUnreachable(Duration),

    /// Every port mapping strategy failed
    #[error("all port mapping methods failed")]
    NatMappingExhausted,

    /// Signature, key agreement or AEAD failure
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[from] CryptoError),

    /// Connection is closing and refuses new writes
    #[error("connection is closing")]
    ConnectionClosing,

    /// Connection was reset
    #[error("connection reset")]
    ConnectionReset,

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl Error {
    /// True if the error ends the reliable connection it occurred on
    #[must_use]
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. }
                | Self::HandshakeRejected
                | Self::RetransmissionExhausted { .. }
                | Self::PeerUnreachable { .. }
                | Self::ConnectionReset
        )
    }

    /// True if the error only affects a single message and the channel carries on
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge(_)
                | Self::ReassemblyTimeout(_)
                | Self::NatMappingExhausted
                | Self::AuthenticationFailed(_)
        )
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::HandshakeTimeout { attempts: 5 }.is_fatal_to_connection());
        assert!(Error::HandshakeRejected.is_fatal_to_connection());
        assert!(Error::PeerUnreachable { probes: 3 }.is_fatal_to_connection());
        assert!(!Error::FrameTooLarge("x".into()).is_fatal_to_connection());

        assert!(Error::ReassemblyTimeout(7).is_transient());
        assert!(Error::AuthenticationFailed(CryptoError::DecryptionFailed).is_transient());
        assert!(!Error::SuperPeerUnreachable(Duration::from_secs(1)).is_transient());
        assert!(!Error::SuperPeerUnreachable(Duration::from_secs(1)).is_fatal_to_connection());
    }

    #[test]
    fn test_from_crypto_error() {
        let err: Error = CryptoError::InvalidSignature.into();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::HandshakeTimeout { attempts: 6 }.to_string(),
            "handshake timed out after 6 attempts"
        );
        assert_eq!(Error::ReassemblyTimeout(3).to_string(), "reassembly of message 3 timed out");
    }
}
