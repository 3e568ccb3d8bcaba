//! Relay transport abstraction
//!
//! A transport holds one connection to one relay and at most one live
//! subscription. It moves signed events only; payload encryption happens
//! a layer up.
//!
//! - [`WebSocketRelay`]: a real relay over WebSocket
//! - [`memory::MemoryRelay`]: an in-process hub for tests and demos

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::SignedEvent;

pub mod websocket;
pub use websocket::WebSocketRelay;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Relay unreachable
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No live connection
    #[error("Connection closed")]
    Disconnected,

    /// Writing to the relay failed
    #[error("Failed to send: {0}")]
    SendFailed(String),

    /// The relay sent something unparseable
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Which events a subscription receives
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Accepted kinds; empty accepts all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,
    /// Hex public keys that must appear in a `p` tag; empty accepts all
    #[serde(rename = "#p", default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
    /// Oldest accepted `created_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
}

impl Filter {
    /// Whether `event` passes this filter
    pub fn matches(&self, event: &SignedEvent) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&event.kind);
        let recipient_ok = self.recipients.is_empty()
            || event.tags.iter().any(|tag| {
                tag.len() >= 2 && tag[0] == "p" && self.recipients.iter().any(|r| *r == tag[1])
            });
        let since_ok = self.since.map_or(true, |since| event.created_at >= since);

        kind_ok && recipient_ok && since_ok
    }
}

/// A live subscription
///
/// Yields an `Err` for a relay frame that was meant for this subscription
/// but could not be parsed; the stream continues after it. The stream ends
/// when the subscription is replaced, torn down, or the connection drops.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    rx: mpsc::UnboundedReceiver<TransportResult<SignedEvent>>,
}

impl Subscription {
    /// Wrap a receiving channel
    pub fn new(
        id: impl Into<String>,
        rx: mpsc::UnboundedReceiver<TransportResult<SignedEvent>>,
    ) -> Self {
        Subscription { id: id.into(), rx }
    }

    /// Subscription id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next matching event, or `None` once the subscription is closed
    pub async fn next(&mut self) -> Option<TransportResult<SignedEvent>> {
        self.rx.recv().await
    }
}

/// Connection to a single relay
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Address of the configured relay
    fn relay_url(&self) -> &str;

    /// Whether a connection is currently open
    fn is_connected(&self) -> bool;

    /// Open the connection if needed; a no-op while connected
    async fn ensure_connected(&self) -> TransportResult<()>;

    /// Send a signed event
    async fn publish(&self, event: &SignedEvent) -> TransportResult<()>;

    /// Open the one live subscription, closing any previous one first
    async fn subscribe(&self, filter: Filter) -> TransportResult<Subscription>;

    /// Close the subscription, then the connection; safe to repeat
    async fn teardown(&self);
}

/// In-memory relay hub
///
/// Each [`MemoryRelay::client`] behaves like a separate connection to the
/// same relay, so a test can run the app and a scripted signer side by side.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    struct Route {
        sub_id: String,
        filter: Filter,
        tx: mpsc::UnboundedSender<TransportResult<SignedEvent>>,
    }

    #[derive(Default)]
    struct HubState {
        offline: bool,
        connections_opened: usize,
        connected: HashSet<u64>,
        routes: HashMap<u64, Route>,
        published: Vec<SignedEvent>,
        next_client: u64,
        next_sub: u64,
    }

    /// Shared relay state
    #[derive(Clone, Default)]
    pub struct MemoryRelay {
        state: Arc<Mutex<HubState>>,
    }

    impl MemoryRelay {
        /// Create an empty relay
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, HubState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// A new, not yet connected client
        pub fn client(&self) -> MemoryRelayClient {
            let mut state = self.lock();
            state.next_client += 1;
            MemoryRelayClient {
                relay: self.clone(),
                client_id: state.next_client,
            }
        }

        /// Refuse new connections while `offline`
        pub fn set_offline(&self, offline: bool) {
            self.lock().offline = offline;
        }

        /// Drop every connection, ending all subscription streams
        pub fn drop_connections(&self) {
            let mut state = self.lock();
            state.connected.clear();
            state.routes.clear();
        }

        /// Hand an unparseable frame to every subscription listening for `recipient`
        pub fn deliver_invalid(&self, recipient: &str, detail: &str) {
            let state = self.lock();
            let listening = state.routes.values().filter(|route| {
                let wanted = &route.filter.recipients;
                wanted.is_empty() || wanted.iter().any(|r| r == recipient)
            });
            for route in listening {
                let _ = route
                    .tx
                    .send(Err(TransportError::InvalidData(detail.to_string())));
            }
        }

        /// Connections successfully opened so far
        pub fn connections_opened(&self) -> usize {
            self.lock().connections_opened
        }

        /// Live subscriptions across all clients
        pub fn live_subscriptions(&self) -> usize {
            self.lock().routes.len()
        }

        /// Every event published so far, in order
        pub fn published(&self) -> Vec<SignedEvent> {
            self.lock().published.clone()
        }
    }

    /// One connection to a [`MemoryRelay`]
    pub struct MemoryRelayClient {
        relay: MemoryRelay,
        client_id: u64,
    }

    #[async_trait]
    impl RelayTransport for MemoryRelayClient {
        fn relay_url(&self) -> &str {
            "memory://relay"
        }

        fn is_connected(&self) -> bool {
            self.relay.lock().connected.contains(&self.client_id)
        }

        async fn ensure_connected(&self) -> TransportResult<()> {
            let mut state = self.relay.lock();
            if state.connected.contains(&self.client_id) {
                return Ok(());
            }
            if state.offline {
                return Err(TransportError::ConnectionFailed(
                    "relay is offline".to_string(),
                ));
            }
            state.connected.insert(self.client_id);
            state.connections_opened += 1;
            Ok(())
        }

        async fn publish(&self, event: &SignedEvent) -> TransportResult<()> {
            let mut state = self.relay.lock();
            if !state.connected.contains(&self.client_id) {
                return Err(TransportError::Disconnected);
            }
            state.published.push(event.clone());
            for route in state.routes.values() {
                if route.filter.matches(event) {
                    // a closed receiver just means that subscriber went away
                    let _ = route.tx.send(Ok(event.clone()));
                }
            }
            Ok(())
        }

        async fn subscribe(&self, filter: Filter) -> TransportResult<Subscription> {
            let mut state = self.relay.lock();
            if !state.connected.contains(&self.client_id) {
                return Err(TransportError::Disconnected);
            }
            state.next_sub += 1;
            let sub_id = format!("mem-{}", state.next_sub);
            let (tx, rx) = mpsc::unbounded_channel();

            // replacing the route drops the previous sender, closing that stream
            state.routes.insert(
                self.client_id,
                Route {
                    sub_id: sub_id.clone(),
                    filter,
                    tx,
                },
            );
            Ok(Subscription::new(sub_id, rx))
        }

        async fn teardown(&self) {
            let mut state = self.relay.lock();
            if let Some(route) = state.routes.remove(&self.client_id) {
                tracing::debug!(sub = %route.sub_id, "closed memory subscription");
            }
            state.connected.remove(&self.client_id);
        }
    }
}
