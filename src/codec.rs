//! Payload encryption between two identities
//!
//! The session only sees the [`MessageCodec`] trait, so the cipher can be
//! swapped without touching correlation or pairing logic.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

use crate::crypto::{Cipher, CryptoError, CryptoResult, Identity, KeyExchange, PublicKey};

/// Key-derivation context for payload keys
const PAYLOAD_KEY_CONTEXT: &str = "remote-signer 2024-06 payload key v1";

/// An inbound message could not be turned into a protocol payload
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Ciphertext is not valid base64
    #[error("Ciphertext is not base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Key agreement or authenticated decryption failed
    #[error("Decryption failed: {0}")]
    Crypto(#[from] CryptoError),

    /// Plaintext is not UTF-8
    #[error("Plaintext is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Plaintext is not a known payload
    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The envelope around the payload is unusable
    #[error("Malformed envelope: {0}")]
    Envelope(String),
}

/// Pluggable shared-secret cipher
pub trait MessageCodec: Send + Sync {
    /// Encrypt `plaintext` from `own` to `peer`
    fn encrypt(&self, own: &Identity, peer: &PublicKey, plaintext: &str) -> CryptoResult<String>;

    /// Decrypt `ciphertext` that `peer` sent to `own`
    fn decrypt(&self, own: &Identity, peer: &PublicKey, ciphertext: &str)
        -> Result<String, DecodeError>;
}

/// X25519 agreement, BLAKE3-derived key, ChaCha20-Poly1305, base64 text
///
/// Sender and recipient keys are bound as associated data, so a
/// ciphertext cannot be replayed under a different sender.
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedSecretCodec;

impl SharedSecretCodec {
    fn payload_key(own: &Identity, peer: &PublicKey) -> CryptoResult<[u8; 32]> {
        Ok(KeyExchange::shared(own, peer)?.derive_key(PAYLOAD_KEY_CONTEXT))
    }

    fn direction(sender: &PublicKey, recipient: &PublicKey) -> [u8; 64] {
        let mut aad = [0u8; 64];
        aad[..32].copy_from_slice(sender.as_bytes());
        aad[32..].copy_from_slice(recipient.as_bytes());
        aad
    }
}

impl MessageCodec for SharedSecretCodec {
    fn encrypt(&self, own: &Identity, peer: &PublicKey, plaintext: &str) -> CryptoResult<String> {
        let key = Self::payload_key(own, peer)?;
        let aad = Self::direction(own.public_key(), peer);
        let sealed = Cipher::seal(&key, plaintext.as_bytes(), &aad)?;
        Ok(BASE64.encode(sealed))
    }

    fn decrypt(
        &self,
        own: &Identity,
        peer: &PublicKey,
        ciphertext: &str,
    ) -> Result<String, DecodeError> {
        let sealed = BASE64.decode(ciphertext.trim())?;
        let key = Self::payload_key(own, peer)?;
        let aad = Self::direction(peer, own.public_key());
        let plaintext = Cipher::open(&key, &sealed, &aad)?;
        Ok(String::from_utf8(plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parties_can_read_each_other() {
        let app = Identity::generate();
        let signer = Identity::generate();
        let codec = SharedSecretCodec;

        let ct = codec.encrypt(&app, signer.public_key(), "hello signer").unwrap();
        assert_eq!(
            codec.decrypt(&signer, app.public_key(), &ct).unwrap(),
            "hello signer"
        );

        let reply = codec.encrypt(&signer, app.public_key(), "hello app").unwrap();
        assert_eq!(codec.decrypt(&app, signer.public_key(), &reply).unwrap(), "hello app");
    }

    #[test]
    fn test_wrong_sender_is_decode_error() {
        let app = Identity::generate();
        let signer = Identity::generate();
        let stranger = Identity::generate();
        let codec = SharedSecretCodec;

        let ct = codec.encrypt(&stranger, app.public_key(), "spoof").unwrap();
        let err = codec.decrypt(&app, signer.public_key(), &ct).unwrap_err();
        assert!(matches!(err, DecodeError::Crypto(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_own_message_cannot_be_reflected() {
        let app = Identity::generate();
        let signer = Identity::generate();
        let codec = SharedSecretCodec;

        // Same shared key both ways, but the direction is bound in the AAD
        let ct = codec.encrypt(&app, signer.public_key(), "request").unwrap();
        assert!(codec.decrypt(&app, signer.public_key(), &ct).is_err());
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let app = Identity::generate();
        let signer = Identity::generate();
        let codec = SharedSecretCodec;

        assert!(matches!(
            codec.decrypt(&app, signer.public_key(), "%%% not base64"),
            Err(DecodeError::Base64(_))
        ));
        assert!(matches!(
            codec.decrypt(&app, signer.public_key(), "c2hvcnQ="),
            Err(DecodeError::Crypto(_))
        ));
    }
}
