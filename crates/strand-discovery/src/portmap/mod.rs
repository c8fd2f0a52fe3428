//! NAT port mapping.
//!
//! A node behind a NAT asks its gateway to forward an external port to its
//! UDP socket so peers can reach it directly. Several protocols exist and
//! gateways support different subsets, so strategies are tried in order by
//! the [`PortMapper`] cycler. Failing every strategy is not fatal: the node
//! keeps working through super peer relaying.

mod cycler;
mod nat_pmp;
mod pcp;

pub use cycler::PortMapper;
pub use nat_pmp::NatPmpMapping;
pub use pcp::{NONCE_LEN as PCP_NONCE_LEN, PcpMapping};

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Port mapping errors
#[derive(Debug, Error)]
pub enum PortMapError {
    /// I/O error talking to the gateway
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Gateway did not answer
    #[error("gateway did not respond")]
    Timeout,

    /// Gateway answered with a non-zero result code
    #[error("gateway rejected request with result code {0}")]
    Rejected(u16),

    /// Response could not be parsed
    #[error("malformed gateway response: {0}")]
    Malformed(&'static str),
}

/// An active mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingLease {
    /// Publicly reachable address
    pub external: SocketAddr,
    /// How long the gateway keeps the mapping
    pub lifetime: Duration,
}

impl MappingLease {
    /// When to renew: half the lifetime, at least one second
    #[must_use]
    pub fn refresh_after(&self) -> Duration {
        (self.lifetime / 2).max(Duration::from_secs(1))
    }
}

/// One NAT traversal strategy
#[async_trait]
pub trait PortMapping: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Create or renew a mapping for `internal_port`.
    ///
    /// # Errors
    ///
    /// Returns a [`PortMapError`] if the gateway refuses or does not answer.
    async fn map(&mut self, internal_port: u16) -> Result<MappingLease, PortMapError>;

    /// Remove the mapping, if any. Calling it without a mapping is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`PortMapError`] if the gateway could not be told.
    async fn unmap(&mut self) -> Result<(), PortMapError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_after_is_half_lifetime() {
        let lease = MappingLease {
            external: "203.0.113.1:4000".parse().unwrap(),
            lifetime: Duration::from_secs(7200),
        };
        assert_eq!(lease.refresh_after(), Duration::from_secs(3600));
    }

    #[test]
    fn test_refresh_after_minimum() {
        let lease = MappingLease {
            external: "203.0.113.1:4000".parse().unwrap(),
            lifetime: Duration::from_secs(1),
        };
        assert_eq!(lease.refresh_after(), Duration::from_secs(1));
    }

    #[test]
    fn test_error_display() {
        assert!(PortMapError::Rejected(3).to_string().contains("code 3"));
        assert_eq!(PortMapError::Timeout.to_string(), "gateway did not respond");
    }
}
