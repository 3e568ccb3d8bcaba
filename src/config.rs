//! Client configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file is
//! valid.
//!
//! ```toml
//! relay_url = "wss://relay.example"
//! client_id = "corner-shop"
//! request_timeout_secs = 30
//!
//! [metadata]
//! name = "Corner Shop"
//! url = "https://shop.example"
//! description = "Storefront"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::uri::{AppMetadata, DEFAULT_SCHEME};

/// Default relay
pub const DEFAULT_RELAY_URL: &str = "wss://relay.nsec.app";

/// Default request timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Session configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// The single relay used for pairing and requests
    pub relay_url: String,
    /// Scheme of the pairing URI
    pub uri_scheme: String,
    /// Value of the `client` tag on every envelope
    pub client_id: String,
    /// How the app introduces itself in the pairing URI
    pub metadata: AppMetadata,
    /// Seconds a request may stay unanswered
    pub request_timeout_secs: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        ConnectConfig {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            uri_scheme: DEFAULT_SCHEME.to_string(),
            client_id: env!("CARGO_PKG_NAME").to_string(),
            metadata: AppMetadata {
                name: env!("CARGO_PKG_NAME").to_string(),
                url: String::new(),
                description: String::new(),
            },
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ConnectConfig {
    /// Parse and validate a TOML document
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: ConnectConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.relay_url.starts_with("wss://") || self.relay_url.starts_with("ws://")) {
            return Err(ConfigError::Invalid(format!(
                "relay_url must be a ws:// or wss:// address, got {:?}",
                self.relay_url
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        let scheme_ok = !self.uri_scheme.is_empty()
            && self
                .uri_scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !scheme_ok {
            return Err(ConfigError::Invalid(format!(
                "uri_scheme {:?} is not a valid URI scheme",
                self.uri_scheme
            )));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::Invalid("client_id must not be empty".to_string()));
        }
        Ok(())
    }

    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
