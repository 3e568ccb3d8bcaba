//! # Remote Signer
//!
//! Lets an application delegate event signing to an external signer app
//! without ever holding the user's private key.
//!
//! ## Features
//!
//! - **Pairing** through a `nostrconnect://` URI and a `connect` handshake
//! - **Encrypted requests** correlated by id over a single relay
//! - **Explicit cancellation**: `disconnect()` rejects everything in flight
//! - **Pluggable** relay transport, payload codec and durable storage
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use remote_signer::{ConnectConfig, ConnectSession, FileStore, UnsignedEvent, WebSocketRelay};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectConfig::default();
//! let store = Arc::new(FileStore::open("store.json")?);
//! let relay = Arc::new(WebSocketRelay::new(config.relay_url.clone()));
//! let session = ConnectSession::new(config, store, relay);
//!
//! println!("Scan with your signer: {}", session.connection_uri());
//! session.begin_pairing().await?;
//!
//! let signed = session
//!     .sign_event(UnsignedEvent::new(1, Vec::new(), "hello"))
//!     .await?;
//! println!("signed {}", signed.id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               CONNECT SESSION               │
//! │  Pairing state | Request correlator | URI   │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │              PROTOCOL LAYER                 │
//! │   Envelopes (kind 24133) | Payload codec    │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │               CRYPTO LAYER                  │
//! │  Ed25519 | X25519 | ChaCha20-Poly1305 | BLAKE3
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │             TRANSPORT LAYER                 │
//! │        WebSocket relay | In-memory hub      │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod keys;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;
pub mod uri;

// Re-export main types at crate root
pub use codec::{DecodeError, MessageCodec, SharedSecretCodec};
pub use config::{ConfigError, ConnectConfig};
pub use crypto::{CryptoError, CryptoResult, Identity, PublicKey, SignatureBytes};
pub use error::{ConnectError, ConnectResult};
pub use event::{SignedEvent, UnsignedEvent};
pub use keys::load_or_create_identity;
pub use session::{ConnectSession, PairingState};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
pub use transport::{RelayTransport, TransportError, WebSocketRelay};
pub use uri::{build_connection_uri, AppMetadata, ConnectionUri};
