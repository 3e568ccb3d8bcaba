//! Cryptographic primitives
//!
//! - `identity`: Ed25519 keys that sign every envelope
//! - `exchange`: X25519 agreement over the same identity keys
//! - `cipher`: ChaCha20-Poly1305 AEAD for payload content
//! - `hash`: BLAKE3 event ids and key derivation

pub mod cipher;
pub mod error;
pub mod exchange;
pub mod hash;
pub mod identity;

pub use cipher::Cipher;
pub use error::{CryptoError, CryptoResult};
pub use exchange::{KeyExchange, SharedSecret};
pub use hash::Hash;
pub use identity::{Identity, PublicKey, SignatureBytes};

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn test_identity_keys_encrypt_between_parties() {
        let app = Identity::generate();
        let signer = Identity::generate();

        let app_key = KeyExchange::shared(&app, signer.public_key())
            .unwrap()
            .derive_key("test payload key");
        let signer_key = KeyExchange::shared(&signer, app.public_key())
            .unwrap()
            .derive_key("test payload key");
        assert_eq!(app_key, signer_key);

        let sealed = Cipher::seal(&app_key, b"sign this", b"").unwrap();
        let opened = Cipher::open(&signer_key, &sealed, b"").unwrap();
        assert_eq!(opened, b"sign this");
    }

    #[test]
    fn test_random_bytes_differ() {
        assert_ne!(random_bytes::<16>(), random_bytes::<16>());
    }
}
