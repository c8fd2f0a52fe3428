//! Opaque crypto service used by the transport core.
//!
//! The core never touches key material directly. It calls a
//! [`CryptoService`] to sign and verify discovery messages and to encrypt and
//! decrypt application payloads for a given peer. Every failure surfaces as a
//! [`CryptoError`], which the core reports as an authentication failure.
//!
//! [`IdentityCrypto`] is the default implementation:
//!
//! ```text
//! local Ed25519 secret ──► X25519 scalar ─┐
//!                                         ├─► X25519 ─► BLAKE3 derive_key ─► ChaCha20-Poly1305
//! peer Ed25519 public  ──► Montgomery u  ─┘
//! ```
//!
//! Ciphertexts are laid out as `[12-byte random nonce][ciphertext + tag]`
//! and bind both addresses as associated data, so a payload encrypted for
//! one direction does not decrypt in the other.

use crate::identity::{self, Identity, Signature};
use crate::{AEAD_NONCE_SIZE, AEAD_TAG_SIZE, CryptoError, PeerAddress};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

const KDF_CONTEXT: &str = "strand 2024 peer payload key";

/// Sign/verify/encrypt/decrypt keyed by peer public key
pub trait CryptoService: Send + Sync {
    /// Address of the local identity
    fn local_address(&self) -> PeerAddress;

    /// Sign a message with the local identity
    fn sign(&self, message: &[u8]) -> Signature;

    /// Verify a signature made by `peer`
    ///
    /// # Errors
    ///
    /// Returns a [`CryptoError`] if the signature does not authenticate the message.
    fn verify(
        &self,
        peer: &PeerAddress,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError>;

    /// Encrypt a payload for `peer`
    ///
    /// # Errors
    ///
    /// Returns a [`CryptoError`] if no key can be agreed with the peer.
    fn encrypt(&self, peer: &PeerAddress, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt a payload sent by `peer`
    ///
    /// # Errors
    ///
    /// Returns a [`CryptoError`] if the ciphertext is malformed or fails authentication.
    fn decrypt(&self, peer: &PeerAddress, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// [`CryptoService`] backed by a local [`Identity`]
pub struct IdentityCrypto {
    identity: Identity,
    address: PeerAddress,
}

impl IdentityCrypto {
    /// Wrap an identity
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        let address = identity.address();
        Self { identity, address }
    }

    fn payload_key(&self, peer: &PeerAddress) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let peer_key = ed25519_dalek::VerifyingKey::from_bytes(peer.as_bytes())
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let peer_public = x25519_dalek::PublicKey::from(peer_key.to_montgomery().to_bytes());
        let secret = x25519_dalek::StaticSecret::from(*self.identity.agreement_secret());
        let shared = secret.diffie_hellman(&peer_public);
        if !shared.was_contributory() {
            return Err(CryptoError::LowOrderPoint);
        }
        Ok(Zeroizing::new(blake3::derive_key(
            KDF_CONTEXT,
            shared.as_bytes(),
        )))
    }
}

fn associated_data(sender: &PeerAddress, recipient: &PeerAddress) -> [u8; 64] {
    let mut aad = [0u8; 64];
    aad[..32].copy_from_slice(sender.as_bytes());
    aad[32..].copy_from_slice(recipient.as_bytes());
    aad
}

impl CryptoService for IdentityCrypto {
    fn local_address(&self) -> PeerAddress {
        self.address
    }

    fn sign(&self, message: &[u8]) -> Signature {
        self.identity.sign(message)
    }

    fn verify(
        &self,
        peer: &PeerAddress,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        identity::verify(peer, message, signature)
    }

    fn encrypt(&self, peer: &PeerAddress, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.payload_key(peer)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));

        let mut nonce = [0u8; AEAD_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let aad = associated_data(&self.address, peer);

        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(AEAD_NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, peer: &PeerAddress, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < AEAD_NONCE_SIZE + AEAD_TAG_SIZE {
            return Err(CryptoError::CiphertextTooShort(ciphertext.len()));
        }
        let key = self.payload_key(peer)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let (nonce, sealed) = ciphertext.split_at(AEAD_NONCE_SIZE);
        let aad = associated_data(peer, &self.address);

        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
