//! Signed, timestamped relay events
//!
//! An event id is the BLAKE3 hash of the canonical JSON array
//! `[0, pubkey, created_at, kind, tags, content]`; the signature covers the
//! raw id bytes.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::crypto::hash::HashOutput;
use crate::crypto::{CryptoError, CryptoResult, Hash, Identity, PublicKey, SignatureBytes};

/// Event tags: each tag is a name followed by its values
pub type Tags = Vec<Vec<String>>;

/// An event skeleton before signing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    /// Event kind
    pub kind: u16,
    /// Unix seconds
    pub created_at: u64,
    /// Tags
    #[serde(default)]
    pub tags: Tags,
    /// Content
    #[serde(default)]
    pub content: String,
}

impl UnsignedEvent {
    /// A skeleton stamped with the current time
    pub fn new(kind: u16, tags: Tags, content: impl Into<String>) -> Self {
        UnsignedEvent {
            kind,
            created_at: unix_now(),
            tags,
            content: content.into(),
        }
    }

    /// Id this event would have when signed by `pubkey`
    pub fn id_for(&self, pubkey: &PublicKey) -> String {
        hex::encode(self.id_bytes(pubkey))
    }

    fn id_bytes(&self, pubkey: &PublicKey) -> HashOutput {
        compute_id(pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// Sign locally
    pub fn sign(self, identity: &Identity) -> SignedEvent {
        let pubkey = *identity.public_key();
        let id_bytes = self.id_bytes(&pubkey);
        let sig = identity.sign(&id_bytes);

        SignedEvent {
            id: hex::encode(id_bytes),
            pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

/// A fully signed event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvent {
    /// Hex hash of the canonical serialization
    pub id: String,
    /// Author
    pub pubkey: PublicKey,
    /// Unix seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Tags
    pub tags: Tags,
    /// Content
    pub content: String,
    /// Signature over the id bytes
    pub sig: SignatureBytes,
}

impl SignedEvent {
    /// Check that the id matches the content and the signature matches the id
    pub fn verify(&self) -> CryptoResult<()> {
        let expected = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if hex::encode(expected) != self.id {
            return Err(CryptoError::SignatureVerificationFailed);
        }

        self.pubkey.verify(&expected, &self.sig)
    }

    /// First value of the first tag named `name`
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// Whether a `p` tag addresses `pubkey`
    pub fn is_addressed_to(&self, pubkey: &PublicKey) -> bool {
        let hex = pubkey.to_hex();
        self.tags
            .iter()
            .any(|tag| tag.len() >= 2 && tag[0] == "p" && tag[1] == hex)
    }
}

fn compute_id(
    pubkey: &PublicKey,
    created_at: u64,
    kind: u16,
    tags: &Tags,
    content: &str,
) -> HashOutput {
    let canonical = serde_json::json!([0, pubkey.to_hex(), created_at, kind, tags, content]);
    Hash::hash(canonical.to_string().as_bytes())
}

/// Wall-clock Unix seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UnsignedEvent {
        UnsignedEvent {
            kind: 22242,
            created_at: 1_700_000_000,
            tags: vec![vec!["challenge".into(), "abc".into()]],
            content: String::new(),
        }
    }

    #[test]
    fn test_signed_event_verifies() {
        let identity = Identity::generate();
        let event = sample().sign(&identity);

        assert_eq!(&event.pubkey, identity.public_key());
        assert_eq!(event.id.len(), 64);
        assert!(event.verify().is_ok());
    }

    #[test]
    fn test_tampered_content_fails_verification() {
        let identity = Identity::generate();
        let mut event = sample().sign(&identity);
        event.content = "changed".into();

        assert!(event.verify().is_err());
    }

    #[test]
    fn test_foreign_signature_fails_verification() {
        let author = Identity::generate();
        let forger = Identity::generate();
        let mut event = sample().sign(&author);
        event.sig = forger.sign(&hex::decode(&event.id).unwrap());

        assert_eq!(event.verify(), Err(CryptoError::SignatureVerificationFailed));
    }

    #[test]
    fn test_id_is_independent_of_signer_secret() {
        let identity = Identity::generate();
        let unsigned = sample();

        let expected = unsigned.id_for(identity.public_key());
        assert_eq!(unsigned.sign(&identity).id, expected);
    }

    #[test]
    fn test_json_shape() {
        let identity = Identity::from_seed(&[1u8; 32]);
        let event = sample().sign(&identity);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["pubkey"], identity.public_key().to_hex());
        assert_eq!(value["kind"], 22242);
        assert_eq!(value["sig"].as_str().unwrap().len(), 128);

        let back: SignedEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_tag_helpers() {
        let identity = Identity::generate();
        let peer = Identity::generate();
        let event = UnsignedEvent::new(
            1,
            vec![
                vec!["p".into(), peer.public_key().to_hex()],
                vec!["client".into(), "shop".into()],
            ],
            "",
        )
        .sign(&identity);

        assert!(event.is_addressed_to(peer.public_key()));
        assert!(!event.is_addressed_to(identity.public_key()));
        assert_eq!(event.tag_value("client"), Some("shop"));
        assert_eq!(event.tag_value("missing"), None);
    }
}
