//! Errors surfaced by the connect session

use thiserror::Error;

use crate::codec::DecodeError;
use crate::crypto::CryptoError;
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Errors returned by [`ConnectSession`](crate::ConnectSession) operations
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Relay unreachable or connection dropped
    #[error("Relay transport error: {0}")]
    Transport(#[from] TransportError),

    /// An inbound message could not be decrypted or parsed
    #[error("Could not decode message: {0}")]
    Decode(#[from] DecodeError),

    /// Local cryptographic failure while building a request
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Durable storage rejected a write
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A request body could not be serialized
    #[error("Could not encode request: {0}")]
    Encode(#[from] serde_json::Error),

    /// No answer arrived within the request timeout
    #[error("Request {id} timed out")]
    Timeout {
        /// Correlation id of the request
        id: String,
    },

    /// The session was disconnected while the request was in flight
    #[error("Request {id} was cancelled")]
    Cancelled {
        /// Correlation id of the request
        id: String,
    },

    /// No remote signer has been paired
    #[error("No remote signer is paired")]
    Unpaired,

    /// The remote signer answered with an error
    #[error("Remote signer refused: {0}")]
    Remote(String),

    /// The remote signer answered with something unusable
    #[error("Invalid response from remote signer: {0}")]
    InvalidResponse(String),
}

impl ConnectError {
    /// Whether this error came from `disconnect()`
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ConnectError::Cancelled { .. })
    }

    /// Whether this error is a request timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectError::Timeout { .. })
    }
}

/// Result type for session operations
pub type ConnectResult<T> = Result<T, ConnectError>;
