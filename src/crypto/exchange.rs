//! X25519 key agreement between two identities
//!
//! Both sides convert their Ed25519 identity keys to Montgomery form, so
//! the public key carried in an envelope is all a peer needs to derive
//! the shared secret.

use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::{CryptoError, CryptoResult};
use super::hash::Hash;
use super::identity::{Identity, PublicKey};

/// Size of a shared secret in bytes
pub const SHARED_SECRET_SIZE: usize = 32;

/// Shared secret derived from key exchange
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    secret: [u8; SHARED_SECRET_SIZE],
}

impl SharedSecret {
    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.secret
    }

    /// Derive a key from this shared secret for a specific purpose
    pub fn derive_key(&self, context: &str) -> [u8; 32] {
        Hash::derive_key(context, &self.secret)
    }
}

/// Key exchange operations
pub struct KeyExchange;

impl KeyExchange {
    /// ECDH between our identity and a peer's identity public key
    ///
    /// Symmetric: `shared(a, B) == shared(b, A)`.
    pub fn shared(own: &Identity, peer: &PublicKey) -> CryptoResult<SharedSecret> {
        let mut scalar = own.exchange_secret_bytes();
        let secret = StaticSecret::from(scalar);
        scalar.zeroize();

        let peer_public = X25519Public::from(peer.to_exchange_bytes()?);
        let shared = secret.diffie_hellman(&peer_public);

        if !shared.was_contributory() {
            return Err(CryptoError::KeyAgreementFailed(
                "peer key is of small order".to_string(),
            ));
        }

        Ok(SharedSecret {
            secret: shared.to_bytes(),
        })
    }
}
