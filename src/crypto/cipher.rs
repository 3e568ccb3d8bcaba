//! ChaCha20-Poly1305 AEAD encryption

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use super::error::{CryptoError, CryptoResult};

/// Size of the encryption key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric cipher for payload content
pub struct Cipher;

impl Cipher {
    /// Encrypt with associated data under a fresh random nonce
    ///
    /// Returns: nonce || ciphertext || tag
    pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(key.into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt `nonce || ciphertext || tag`; the AAD must match
    pub fn open(key: &[u8; KEY_SIZE], sealed: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = ChaCha20Poly1305::new(key.into());
        let (nonce, encrypted) = sealed.split_at(NONCE_SIZE);

        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: encrypted, aad })
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
