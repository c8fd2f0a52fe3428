//! NAT-PMP (RFC 6886) client.
//!
//! Wire format (all integers big-endian):
//!
//! ```text
//! external address request : [ver=0][op=0]
//! external address response: [ver=0][op=128][result u16][epoch u32][ipv4 4B]
//! map UDP request          : [ver=0][op=1][reserved u16][internal u16][external u16][lifetime u32]
//! map UDP response         : [ver=0][op=129][result u16][epoch u32][internal u16][external u16][lifetime u32]
//! ```

use super::{MappingLease, PortMapError, PortMapping};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;

/// NAT-PMP server port on the gateway
pub const NAT_PMP_PORT: u16 = 5351;

const VERSION: u8 = 0;
const OP_EXTERNAL_ADDRESS: u8 = 0;
const OP_MAP_UDP: u8 = 1;
const RESPONSE_BIT: u8 = 128;
const DEFAULT_LIFETIME: u32 = 7200;
const INITIAL_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_TRIES: u32 = 4;

fn external_address_request() -> [u8; 2] {
    [VERSION, OP_EXTERNAL_ADDRESS]
}

fn map_request(internal_port: u16, external_port: u16, lifetime: u32) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0] = VERSION;
    buf[1] = OP_MAP_UDP;
    buf[4..6].copy_from_slice(&internal_port.to_be_bytes());
    buf[6..8].copy_from_slice(&external_port.to_be_bytes());
    buf[8..12].copy_from_slice(&lifetime.to_be_bytes());
    buf
}

fn check_header(buf: &[u8], op: u8, len: usize) -> Result<(), PortMapError> {
    if buf.len() < len {
        return Err(PortMapError::Malformed("response too short"));
    }
    if buf[0] != VERSION {
        return Err(PortMapError::Malformed("unsupported version"));
    }
    if buf[1] != op | RESPONSE_BIT {
        return Err(PortMapError::Malformed("unexpected opcode"));
    }
    let result = u16::from_be_bytes([buf[2], buf[3]]);
    if result != 0 {
        return Err(PortMapError::Rejected(result));
    }
    Ok(())
}

fn parse_external_address(buf: &[u8]) -> Result<Ipv4Addr, PortMapError> {
    check_header(buf, OP_EXTERNAL_ADDRESS, 12)?;
    Ok(Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]))
}

/// Parsed map response: (internal port, external port, lifetime secs)
fn parse_map_response(buf: &[u8]) -> Result<(u16, u16, u32), PortMapError> {
    check_header(buf, OP_MAP_UDP, 16)?;
    let internal = u16::from_be_bytes([buf[8], buf[9]]);
    let external = u16::from_be_bytes([buf[10], buf[11]]);
    let lifetime = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
    Ok((internal, external, lifetime))
}

/// NAT-PMP strategy talking to a configured gateway
pub struct NatPmpMapping {
    gateway: SocketAddr,
    lifetime: u32,
    mapped: Option<(u16, u16)>,
}

impl NatPmpMapping {
    /// Strategy for the gateway at `gateway` (port 5351 is added if zero)
    #[must_use]
    pub fn new(gateway: SocketAddr) -> Self {
        let gateway = if gateway.port() == 0 {
            SocketAddr::new(gateway.ip(), NAT_PMP_PORT)
        } else {
            gateway
        };
        Self {
            gateway,
            lifetime: DEFAULT_LIFETIME,
            mapped: None,
        }
    }

    /// Gateway address
    #[must_use]
    pub fn gateway(&self) -> SocketAddr {
        self.gateway
    }

    /// Send `request` and wait for a response, doubling the timeout per try.
    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, PortMapError> {
        let socket = UdpSocket::bind(SocketAddr::new(
            std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
        ))
        .await?;
        socket.connect(self.gateway).await?;

        let mut timeout = INITIAL_TIMEOUT;
        let mut buf = [0u8; 64];
        for attempt in 1..=MAX_TRIES {
            socket.send(request).await?;
            match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => return Ok(buf[..n].to_vec()),
                Ok(Err(e)) => return Err(PortMapError::Io(e)),
                Err(_) => {
                    tracing::trace!(
                        "NAT-PMP request to {} timed out (attempt {}/{})",
                        self.gateway,
                        attempt,
                        MAX_TRIES
                    );
                    timeout *= 2;
                }
            }
        }
        Err(PortMapError::Timeout)
    }
}

#[async_trait]
impl PortMapping for NatPmpMapping {
    fn name(&self) -> &'static str {
        "nat-pmp"
    }

    async fn map(&mut self, internal_port: u16) -> Result<MappingLease, PortMapError> {
        let response = self.exchange(&external_address_request()).await?;
        let external_ip = parse_external_address(&response)?;

        let suggested = self.mapped.map_or(internal_port, |(_, external)| external);
        let response = self
            .exchange(&map_request(internal_port, suggested, self.lifetime))
            .await?;
        let (internal, external, lifetime) = parse_map_response(&response)?;
        if internal != internal_port {
            return Err(PortMapError::Malformed("internal port mismatch"));
        }
        self.mapped = Some((internal, external));

        Ok(MappingLease {
            external: SocketAddr::V4(SocketAddrV4::new(external_ip, external)),
            lifetime: Duration::from_secs(u64::from(lifetime)),
        })
    }

    async fn unmap(&mut self) -> Result<(), PortMapError> {
        let Some((internal, _)) = self.mapped.take() else {
            return Ok(());
        };
        let response = self.exchange(&map_request(internal, 0, 0)).await?;
        parse_map_response(&response).map(|_| ())
    }
}
