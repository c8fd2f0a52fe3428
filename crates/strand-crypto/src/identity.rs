//! Node identity.
//!
//! An [`Identity`] wraps an Ed25519 signing key. Its verifying key doubles
//! as the node's [`PeerAddress`], so an address is always something its owner
//! can prove possession of by signing.
//!
//! ```
//! use strand_crypto::Identity;
//!
//! let identity = Identity::generate();
//! let signature = identity.sign(b"hello");
//! assert!(strand_crypto::identity::verify(&identity.address(), b"hello", &signature).is_ok());
//! ```

use crate::{CryptoError, ED25519_SECRET_KEY_SIZE, ED25519_SIGNATURE_SIZE, PeerAddress};
use ed25519_dalek::{Signer, Verifier};
use rand_core::OsRng;
use zeroize::{Zeroizing, ZeroizeOnDrop};

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; ED25519_SIGNATURE_SIZE]);

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; ED25519_SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; ED25519_SIGNATURE_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(bytes))
    }

    /// Get the raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; ED25519_SIGNATURE_SIZE] {
        &self.0
    }
}

/// Node identity (Ed25519 keypair)
///
/// Secret key material is zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    signing: ed25519_dalek::SigningKey,
}

impl Identity {
    /// Generate a random identity from the OS RNG
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its 32-byte secret seed
    #[must_use]
    pub fn from_secret_bytes(bytes: &[u8; ED25519_SECRET_KEY_SIZE]) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// Restore an identity from a hex-encoded secret seed
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHex`] or [`CryptoError::InvalidKeyLength`]
    /// if the string is not 64 hex characters.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            hex::decode(hex_str.trim()).map_err(|e| CryptoError::InvalidHex(e.to_string()))?,
        );
        let seed: &[u8; ED25519_SECRET_KEY_SIZE] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: ED25519_SECRET_KEY_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self::from_secret_bytes(seed))
    }

    /// Export the secret seed as hex (handle with care)
    #[must_use]
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing.to_bytes()))
    }

    /// The overlay address of this identity
    #[must_use]
    pub fn address(&self) -> PeerAddress {
        PeerAddress::from_bytes(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }

    /// Scalar bytes for X25519 agreement with this identity
    pub(crate) fn agreement_secret(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_scalar_bytes())
    }
}

/// Verify `signature` over `message` against the public key in `address`
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPublicKey`] if the address is not a valid
/// curve point and [`CryptoError::InvalidSignature`] if verification fails.
pub fn verify(
    address: &PeerAddress,
    message: &[u8],
    signature: &Signature,
) -> Result<(), CryptoError> {
    let key = ed25519_dalek::VerifyingKey::from_bytes(address.as_bytes())
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    key.verify(message, &ed25519_dalek::Signature::from_bytes(&signature.0))
        .map_err(|_| CryptoError::InvalidSignature)
}
