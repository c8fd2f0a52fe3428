//! # strand Crypto
//!
//! Identity material and the opaque crypto service consumed by the strand
//! transport core.
//!
//! This crate provides:
//! - [`PeerAddress`]: the stable, public-key-derived overlay address of a node
//! - [`Identity`]: an Ed25519 keypair whose public half is the node's address
//! - [`CryptoService`]: `sign`/`verify`/`encrypt`/`decrypt` keyed by peer
//!   public key, implemented by [`IdentityCrypto`]
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Identity / Signatures | Ed25519 | 128-bit |
//! | Key Agreement | X25519 (Ed25519 keys in Montgomery form) | 128-bit |
//! | KDF | BLAKE3 `derive_key` | 128-bit |
//! | AEAD | ChaCha20-Poly1305 | 256-bit key |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod error;
pub mod identity;
pub mod service;

pub use address::PeerAddress;
pub use error::CryptoError;
pub use identity::{Identity, Signature};
pub use service::{CryptoService, IdentityCrypto};

/// Ed25519 public key size (and therefore [`PeerAddress`] size)
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size
pub const ED25519_SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// ChaCha20-Poly1305 nonce size
pub const AEAD_NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 authentication tag size
pub const AEAD_TAG_SIZE: usize = 16;
