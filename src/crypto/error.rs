//! Errors from key handling, signing and payload encryption

use thiserror::Error;

/// Cryptographic failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A key or signature has the wrong number of bytes
    #[error("Invalid {what} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// What was being decoded
        what: &'static str,
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// The peer key produced a non-contributory shared secret
    #[error("Key agreement failed: {0}")]
    KeyAgreementFailed(String),

    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Authentication tag mismatch, wrong key or tampered data
    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    /// The public key is not valid hex or not a curve point
    #[error("Invalid public key format")]
    InvalidPublicKey,

    /// The secret key is not in canonical hex form
    #[error("Invalid secret key format")]
    InvalidSecretKey,
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
