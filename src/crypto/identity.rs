//! Ed25519 identity keys
//!
//! The local identity signs every envelope this client publishes. Its
//! secret never leaves the process except as the canonical hex string
//! written to durable storage.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::{CryptoError, CryptoResult};

/// Size of a public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a secret key in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of a signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Length of the canonical hex form of a secret key
pub const SECRET_KEY_HEX_LEN: usize = SECRET_KEY_SIZE * 2;

/// A public key identifying one party on the relay
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidLength {
                what: "public key",
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; PUBLIC_KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(PublicKey(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Lowercase hex, the form used in tags, URIs and storage
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex string
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    /// Verify a signature against this public key
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> CryptoResult<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;

        let sig = Signature::from_bytes(&signature.0);

        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }

    /// Montgomery form of this key, usable as an X25519 public key
    pub fn to_exchange_bytes(&self) -> CryptoResult<[u8; 32]> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(verifying_key.to_montgomery().to_bytes())
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

// Hex on the wire rather than a byte array
impl serde::Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A detached Ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes(pub [u8; SIGNATURE_SIZE]);

impl serde::Serialize for SignatureBytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for SignatureBytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl SignatureBytes {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidLength {
                what: "signature",
                expected: SIGNATURE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; SIGNATURE_SIZE];
        arr.copy_from_slice(bytes);
        Ok(SignatureBytes(arr))
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex string
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::SignatureVerificationFailed)?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}...)", &self.to_hex()[..16])
    }
}

/// The local keypair
///
/// The secret key is zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)]
    public_key: PublicKey,
    secret_key: [u8; SECRET_KEY_SIZE],
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_seed(&signing_key.to_bytes())
    }

    /// Derive the keypair from its 32-byte secret
    pub fn from_seed(seed: &[u8; SECRET_KEY_SIZE]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Identity {
            public_key: PublicKey(verifying_key.to_bytes()),
            secret_key: signing_key.to_bytes(),
        }
    }

    /// Parse the canonical storage form: exactly 64 lowercase hex characters
    pub fn from_secret_hex(s: &str) -> CryptoResult<Self> {
        let canonical = s.len() == SECRET_KEY_HEX_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !canonical {
            return Err(CryptoError::InvalidSecretKey);
        }

        let mut bytes = hex::decode(s).map_err(|_| CryptoError::InvalidSecretKey)?;
        let mut seed = [0u8; SECRET_KEY_SIZE];
        seed.copy_from_slice(&bytes);
        bytes.zeroize();

        let identity = Self::from_seed(&seed);
        seed.zeroize();
        Ok(identity)
    }

    /// Canonical storage form of the secret key
    ///
    /// Only the identity manager should call this, to persist the key.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key)
    }

    /// Get the public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// X25519 scalar bytes derived from the signing key
    pub(crate) fn exchange_secret_bytes(&self) -> [u8; 32] {
        SigningKey::from_bytes(&self.secret_key).to_scalar_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        let signing_key = SigningKey::from_bytes(&self.secret_key);
        let signature = signing_key.sign(message);
        SignatureBytes(signature.to_bytes())
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Identity {
            public_key: self.public_key,
            secret_key: self.secret_key,
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}
