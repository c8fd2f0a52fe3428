//! Outer envelope carried in every datagram between nodes.
//!
//! ```text
//! ┌────────────┬────────────┬──────┬──────┬──────────┬───────────┬──────┐
//! │ magic (u32)│ network u32│ kind │ hops │ sender 32│ recipient │ body │
//! │            │            │  u8  │  u8  │          │    32     │      │
//! └────────────┴────────────┴──────┴──────┴──────────┴───────────┴──────┘
//! ```
//!
//! Discovery envelopes (`Hello`, `Ack`, `Unite`) end with an Ed25519
//! signature over every header field except the hop count (relays change
//! it) followed by the payload.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use strand_crypto::{
    CryptoError, CryptoService, ED25519_PUBLIC_KEY_SIZE, ED25519_SIGNATURE_SIZE, PeerAddress,
    Signature,
};

/// Magic number opening every envelope
pub const ENVELOPE_MAGIC: u32 = 0x5354_524F;

/// Envelope header length in bytes
pub const ENVELOPE_HEADER_LEN: usize = 4 + 4 + 1 + 1 + 2 * ED25519_PUBLIC_KEY_SIZE;

/// What an envelope carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Path announcement
    Hello = 1,
    /// Answer to a hello, echoing its timestamp
    Ack = 2,
    /// Super peer introduces two of its children
    Unite = 3,
    /// Channel traffic (segments or chunk records)
    Application = 4,
}

impl EnvelopeKind {
    /// Parse a kind byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Hello),
            2 => Some(Self::Ack),
            3 => Some(Self::Unite),
            4 => Some(Self::Application),
            _ => None,
        }
    }
}

/// One datagram between nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Overlay network id
    pub network_id: u32,
    /// Body type
    pub kind: EnvelopeKind,
    /// Relays traversed so far
    pub hops: u8,
    /// Originating node
    pub sender: PeerAddress,
    /// Final recipient
    pub recipient: PeerAddress,
    /// Kind-specific body
    pub body: Vec<u8>,
}

impl Envelope {
    /// Unsigned envelope with zero hops
    #[must_use]
    pub fn new(
        network_id: u32,
        kind: EnvelopeKind,
        sender: PeerAddress,
        recipient: PeerAddress,
        body: Vec<u8>,
    ) -> Self {
        Self {
            network_id,
            kind,
            hops: 0,
            sender,
            recipient,
            body,
        }
    }

    /// Envelope whose body is `payload` followed by the sender's signature
    #[must_use]
    pub fn signed(
        network_id: u32,
        kind: EnvelopeKind,
        recipient: PeerAddress,
        mut payload: Vec<u8>,
        crypto: &dyn CryptoService,
    ) -> Self {
        let mut envelope = Self::new(network_id, kind, crypto.local_address(), recipient, Vec::new());
        let signature = crypto.sign(&envelope.signing_bytes(&payload));
        payload.extend_from_slice(signature.as_bytes());
        envelope.body = payload;
        envelope
    }

    /// Check the trailing signature and return the signed payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the body is too short or
    /// the signature does not match the sender.
    pub fn verify(&self, crypto: &dyn CryptoService) -> Result<&[u8], CryptoError> {
        let split = self
            .body
            .len()
            .checked_sub(ED25519_SIGNATURE_SIZE)
            .ok_or(CryptoError::InvalidSignature)?;
        let (payload, signature) = self.body.split_at(split);
        let signature = Signature::from_slice(signature)?;
        crypto.verify(&self.sender, &self.signing_bytes(payload), &signature)?;
        Ok(payload)
    }

    fn signing_bytes(&self, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
        bytes.extend_from_slice(&self.network_id.to_be_bytes());
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(self.sender.as_bytes());
        bytes.extend_from_slice(self.recipient.as_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Serialize for the wire
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.body.len());
        buf.extend_from_slice(&ENVELOPE_MAGIC.to_be_bytes());
        buf.extend_from_slice(&self.network_id.to_be_bytes());
        buf.push(self.kind as u8);
        buf.push(self.hops);
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(self.recipient.as_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Parse a datagram; `None` if it is not an envelope
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return None;
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
        if magic != ENVELOPE_MAGIC {
            return None;
        }
        let network_id = u32::from_be_bytes(bytes[4..8].try_into().ok()?);
        let kind = EnvelopeKind::from_u8(bytes[8])?;
        let hops = bytes[9];
        let sender = PeerAddress::from_slice(&bytes[10..42]).ok()?;
        let recipient = PeerAddress::from_slice(&bytes[42..74]).ok()?;
        Some(Self {
            network_id,
            kind,
            hops,
            sender,
            recipient,
            body: bytes[ENVELOPE_HEADER_LEN..].to_vec(),
        })
    }
}

/// Payload of `Hello` and `Ack`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// Sender clock in milliseconds (`Ack` echoes the hello's value)
    pub timestamp_millis: u64,
    /// Sender registers as a child of the recipient
    pub children: bool,
}

impl Hello {
    const LEN: usize = 9;

    /// Serialize
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&self.timestamp_millis.to_be_bytes());
        buf.push(u8::from(self.children));
        buf
    }

    /// Parse
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }
        Some(Self {
            timestamp_millis: u64::from_be_bytes(bytes[..8].try_into().ok()?),
            children: bytes[8] & 0x01 != 0,
        })
    }
}

/// Payload of `Unite`: another child of the same super peer and its endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unite {
    /// Peer to contact directly
    pub peer: PeerAddress,
    /// Endpoint the super peer sees for it
    pub endpoint: SocketAddr,
}

impl Unite {
    /// Serialize: `[32 peer][u8 family 4|6][ip][u16 port]`
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ED25519_PUBLIC_KEY_SIZE + 19);
        buf.extend_from_slice(self.peer.as_bytes());
        match self.endpoint.ip() {
            IpAddr::V4(ip) => {
                buf.push(4);
                buf.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.push(6);
                buf.extend_from_slice(&ip.octets());
            }
        }
        buf.extend_from_slice(&self.endpoint.port().to_be_bytes());
        buf
    }

    /// Parse
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let peer = PeerAddress::from_slice(bytes.get(..ED25519_PUBLIC_KEY_SIZE)?).ok()?;
        let rest = &bytes[ED25519_PUBLIC_KEY_SIZE..];
        let (ip, rest): (IpAddr, &[u8]) = match rest.first()? {
            4 => {
                let octets: [u8; 4] = rest.get(1..5)?.try_into().ok()?;
                (Ipv4Addr::from(octets).into(), &rest[5..])
            }
            6 => {
                let octets: [u8; 16] = rest.get(1..17)?.try_into().ok()?;
                (Ipv6Addr::from(octets).into(), &rest[17..])
            }
            _ => return None,
        };
        let port: [u8; 2] = rest.try_into().ok()?;
        Some(Self {
            peer,
            endpoint: SocketAddr::new(ip, u16::from_be_bytes(port)),
        })
    }
}
