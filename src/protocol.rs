//! Wire protocol between the app and its remote signer
//!
//! Every message is a [`SignedEvent`] of kind [`CONNECT_EVENT_KIND`],
//! addressed with a `p` tag, whose content is an encrypted [`Payload`].

use serde::{Deserialize, Serialize};

use crate::codec::{DecodeError, MessageCodec};
use crate::crypto::{CryptoResult, Identity, PublicKey};
use crate::event::{unix_now, SignedEvent, UnsignedEvent};
use crate::transport::Filter;

/// Event kind reserved for remote-signer traffic
pub const CONNECT_EVENT_KIND: u16 = 24133;

/// Value of the `result` acknowledging a `connect`
pub const CONNECT_ACK: &str = "ack";

/// Value a signer answers `ping` with
pub const PONG: &str = "pong";

/// Decrypted content of an envelope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Signer asks to pair
    Connect { id: String },
    /// Successful answer to a request
    Result { id: String, value: String },
    /// Failed answer to a request
    Error { id: String, message: String },
    /// A call to the counterpart
    Request {
        id: String,
        method: String,
        #[serde(default)]
        params: Vec<String>,
    },
}

impl Payload {
    /// Correlation id
    pub fn id(&self) -> &str {
        match self {
            Payload::Connect { id }
            | Payload::Result { id, .. }
            | Payload::Error { id, .. }
            | Payload::Request { id, .. } => id,
        }
    }

    /// Short label for logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Connect { .. } => "connect",
            Payload::Result { .. } => "result",
            Payload::Error { .. } => "error",
            Payload::Request { .. } => "request",
        }
    }
}

/// Methods the client calls on the signer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// Sign an unsigned event given as JSON; answers with the signed event JSON
    SignEvent,
    /// Answers with the user's public key
    GetPublicKey,
    /// Answers with `pong`
    Ping,
}

impl Method {
    /// Name on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::SignEvent => "sign_event",
            Method::GetPublicKey => "get_public_key",
            Method::Ping => "ping",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encrypt `payload` to `peer` and sign the resulting envelope
pub fn seal_envelope(
    identity: &Identity,
    codec: &dyn MessageCodec,
    peer: &PublicKey,
    client_id: &str,
    payload: &Payload,
) -> CryptoResult<SignedEvent> {
    let plaintext = serde_json::to_string(payload)
        .map_err(|e| crate::crypto::CryptoError::EncryptionFailed(e.to_string()))?;
    let content = codec.encrypt(identity, peer, &plaintext)?;

    let unsigned = UnsignedEvent {
        kind: CONNECT_EVENT_KIND,
        created_at: unix_now(),
        tags: vec![
            vec!["p".to_string(), peer.to_hex()],
            vec!["client".to_string(), client_id.to_string()],
        ],
        content,
    };
    Ok(unsigned.sign(identity))
}

/// Verify an inbound envelope addressed to `identity` and decrypt its payload
pub fn open_envelope(
    identity: &Identity,
    codec: &dyn MessageCodec,
    event: &SignedEvent,
) -> Result<Payload, DecodeError> {
    if event.kind != CONNECT_EVENT_KIND {
        return Err(DecodeError::Envelope(format!("unexpected kind {}", event.kind)));
    }
    if !event.is_addressed_to(identity.public_key()) {
        return Err(DecodeError::Envelope("not addressed to us".to_string()));
    }
    event.verify()?;

    let plaintext = codec.decrypt(identity, &event.pubkey, &event.content)?;
    Ok(serde_json::from_str(&plaintext)?)
}

/// Subscription filter for envelopes addressed to `own`
pub fn inbound_filter(own: &PublicKey) -> Filter {
    Filter {
        kinds: vec![CONNECT_EVENT_KIND],
        recipients: vec![own.to_hex()],
        since: Some(unix_now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SharedSecretCodec;

    #[test]
    fn test_payload_json_is_tagged() {
        let payload = Payload::Request {
            id: "s1-1".into(),
            method: Method::SignEvent.as_str().into(),
            params: vec!["{}".into()],
        };
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["type"], "request");
        assert_eq!(json["method"], "sign_event");

        let connect: Payload = serde_json::from_str(r#"{"type":"connect","id":"c1"}"#).unwrap();
        assert_eq!(connect, Payload::Connect { id: "c1".into() });
        assert_eq!(connect.kind_name(), "connect");
    }

    #[test]
    fn test_unknown_payload_type_rejected() {
        assert!(serde_json::from_str::<Payload>(r#"{"type":"teleport","id":"x"}"#).is_err());
    }

    #[test]
    fn test_envelope_shape_and_open() {
        let app = Identity::generate();
        let signer = Identity::generate();
        let codec = SharedSecretCodec;
        let payload = Payload::Result {
            id: "42".into(),
            value: CONNECT_ACK.into(),
        };

        let envelope = seal_envelope(&app, &codec, signer.public_key(), "shop", &payload).unwrap();

        assert_eq!(envelope.kind, CONNECT_EVENT_KIND);
        assert_eq!(envelope.tag_value("p"), Some(signer.public_key().to_hex().as_str()));
        assert_eq!(envelope.tag_value("client"), Some("shop"));
        assert!(envelope.created_at > 0);
        assert!(!envelope.content.contains("ack"));

        assert_eq!(open_envelope(&signer, &codec, &envelope).unwrap(), payload);
    }

    #[test]
    fn test_open_rejects_foreign_or_tampered() {
        let app = Identity::generate();
        let signer = Identity::generate();
        let bystander = Identity::generate();
        let codec = SharedSecretCodec;
        let payload = Payload::Connect { id: "c".into() };

        let envelope = seal_envelope(&signer, &codec, app.public_key(), "x", &payload).unwrap();
        assert!(matches!(
            open_envelope(&bystander, &codec, &envelope),
            Err(DecodeError::Envelope(_))
        ));

        let mut tampered = envelope.clone();
        tampered.created_at += 1;
        assert!(matches!(
            open_envelope(&app, &codec, &tampered),
            Err(DecodeError::Crypto(_))
        ));
    }

    #[test]
    fn test_inbound_filter_targets_own_key() {
        let app = Identity::generate();
        let filter = inbound_filter(app.public_key());

        assert_eq!(filter.kinds, vec![CONNECT_EVENT_KIND]);
        assert_eq!(filter.recipients, vec![app.public_key().to_hex()]);
    }
}
