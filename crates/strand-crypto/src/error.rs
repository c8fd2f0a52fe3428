//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
///
/// The transport core treats every variant as an authentication failure of
/// the message that triggered it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Ciphertext shorter than nonce plus tag
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Key agreement produced a low-order shared point
    #[error("key agreement rejected low-order point")]
    LowOrderPoint,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Hex decoding failed
    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(CryptoError::InvalidSignature.to_string(), "invalid signature");
        assert!(
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 7
            }
            .to_string()
            .contains("expected 32, got 7")
        );
        assert!(CryptoError::CiphertextTooShort(3).to_string().contains("3 bytes"));
    }
}
