//! Pairing URI shown to the user, typically as a QR code
//!
//! `nostrconnect://<own-pubkey>?relay=<relay>&metadata=<json>`

use serde::{Deserialize, Serialize};
use url::Url;

use crate::crypto::PublicKey;

/// Default URI scheme understood by remote signer apps
pub const DEFAULT_SCHEME: &str = "nostrconnect";

/// How the app describes itself to the signer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Display name
    pub name: String,
    /// Origin the app is served from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Short description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Build the pairing URI; pure and cheap enough to call on every render
pub fn build_connection_uri(
    scheme: &str,
    own_public_key: &PublicKey,
    relay: &str,
    metadata: &AppMetadata,
) -> String {
    // serializing a struct of strings cannot fail
    let metadata_json = serde_json::to_string(metadata).unwrap_or_default();
    let query: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("relay", relay)
        .append_pair("metadata", &metadata_json)
        .finish();

    format!("{}://{}?{}", scheme, own_public_key.to_hex(), query)
}

/// A parsed pairing URI
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionUri {
    /// URI scheme
    pub scheme: String,
    /// Public key of the app awaiting pairing
    pub public_key: PublicKey,
    /// Relay both sides meet on
    pub relay: String,
    /// App description
    pub metadata: AppMetadata,
}

/// Why a pairing URI could not be read
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    /// Not a URI at all
    #[error("Invalid URI: {0}")]
    Malformed(String),

    /// The authority is not a public key
    #[error("URI does not carry a valid public key")]
    InvalidPublicKey,

    /// A required query parameter is absent
    #[error("URI is missing the `{0}` parameter")]
    MissingParameter(&'static str),

    /// Metadata is not the expected JSON object
    #[error("URI metadata is invalid: {0}")]
    InvalidMetadata(String),
}

impl ConnectionUri {
    /// Parse a URI produced by [`build_connection_uri`]
    pub fn parse(uri: &str) -> Result<Self, UriError> {
        let parsed = Url::parse(uri).map_err(|e| UriError::Malformed(e.to_string()))?;

        let public_key = parsed
            .host_str()
            .ok_or(UriError::InvalidPublicKey)
            .and_then(|host| PublicKey::from_hex(host).map_err(|_| UriError::InvalidPublicKey))?;

        let mut relay = None;
        let mut metadata = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "relay" if relay.is_none() => relay = Some(value.into_owned()),
                "metadata" if metadata.is_none() => metadata = Some(value.into_owned()),
                _ => {}
            }
        }

        let relay = relay.ok_or(UriError::MissingParameter("relay"))?;
        let metadata = match metadata {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| UriError::InvalidMetadata(e.to_string()))?,
            None => AppMetadata::default(),
        };

        Ok(ConnectionUri {
            scheme: parsed.scheme().to_string(),
            public_key,
            relay,
            metadata,
        })
    }
}

impl std::fmt::Display for ConnectionUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&build_connection_uri(
            &self.scheme,
            &self.public_key,
            &self.relay,
            &self.metadata,
        ))
    }
}
