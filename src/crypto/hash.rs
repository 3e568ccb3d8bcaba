//! BLAKE3 hashing and key derivation

/// Size of a hash output in bytes
pub const HASH_SIZE: usize = 32;

/// A hash output
pub type HashOutput = [u8; HASH_SIZE];

/// Hashing and key derivation operations
pub struct Hash;

impl Hash {
    /// Compute hash of data
    pub fn hash(data: &[u8]) -> HashOutput {
        blake3::hash(data).into()
    }

    /// Derive a purpose-bound key from key material
    ///
    /// The context must be a hardcoded, globally unique string.
    pub fn derive_key(context: &str, material: &[u8]) -> [u8; 32] {
        blake3::derive_key(context, material)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(Hash::hash(b"event"), Hash::hash(b"event"));
        assert_ne!(Hash::hash(b"event-1"), Hash::hash(b"event-2"));
    }

    #[test]
    fn test_key_derivation() {
        let material = [0u8; 32];

        let key1 = Hash::derive_key("purpose-1", &material);
        let key2 = Hash::derive_key("purpose-2", &material);
        assert_ne!(key1, key2);
        assert_eq!(key1, Hash::derive_key("purpose-1", &material));
    }
}
