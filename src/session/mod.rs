//! Connect session: pairing state machine and signing requests
//!
//! A [`ConnectSession`] owns the local identity, the relay transport and the
//! table of in-flight requests. It is built once per app session and cloned
//! by handle into whatever needs to sign.
//!
//! ```text
//!            begin_pairing()              connect
//!   Idle ───────────────────▶ AwaitingApproval ──────▶ Connected
//!    ▲                                                     │
//!    └──────────────────── disconnect() ◀──────────────────┘
//!
//!   any state ──transport or decode failure──▶ Error { detail }
//! ```

mod correlator;

pub use correlator::{Correlator, PendingResponse};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{DecodeError, MessageCodec, SharedSecretCodec};
use crate::config::ConnectConfig;
use crate::crypto::{Identity, PublicKey};
use crate::error::{ConnectError, ConnectResult};
use crate::event::{SignedEvent, UnsignedEvent};
use crate::keys::load_or_create_identity;
use crate::protocol::{
    inbound_filter, open_envelope, seal_envelope, Method, Payload, CONNECT_ACK,
    CONNECT_EVENT_KIND, PONG,
};
use crate::storage::{KeyValueStore, REMOTE_SIGNER_KEY};
use crate::transport::{RelayTransport, Subscription};
use crate::uri::build_connection_uri;

/// Visible pairing status
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairingState {
    /// No pairing attempt and nothing persisted
    Idle,
    /// Subscription open, waiting for the signer's `connect`
    AwaitingApproval,
    /// A remote signer is known
    Connected {
        /// The paired signer
        remote: PublicKey,
    },
    /// The last transport or decode operation failed
    Error {
        /// Displayable cause
        detail: String,
    },
}

impl PairingState {
    /// Whether a remote signer is paired and the last operation succeeded
    pub fn is_connected(&self) -> bool {
        matches!(self, PairingState::Connected { .. })
    }
}

impl std::fmt::Display for PairingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairingState::Idle => write!(f, "idle"),
            PairingState::AwaitingApproval => write!(f, "awaiting approval"),
            PairingState::Connected { remote } => write!(f, "connected to {}", remote),
            PairingState::Error { detail } => write!(f, "error: {}", detail),
        }
    }
}

struct Inner {
    config: ConnectConfig,
    identity: Identity,
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn RelayTransport>,
    codec: Arc<dyn MessageCodec>,
    correlator: Arc<Correlator>,
    state: watch::Sender<PairingState>,
    remote: Mutex<Option<PublicKey>>,
    listener: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    /// Bumped by every shutdown; requests started under an older value are cancelled
    epoch: AtomicU64,
}

/// Handle to the connect session
#[derive(Clone)]
pub struct ConnectSession {
    inner: Arc<Inner>,
}

impl ConnectSession {
    /// Build a session using the default payload codec
    ///
    /// Loads (or creates) the local identity from `store`. A remote signer
    /// persisted by an earlier session puts the session straight into
    /// [`PairingState::Connected`] without touching the network.
    pub fn new(
        config: ConnectConfig,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn RelayTransport>,
    ) -> Self {
        Self::with_codec(config, store, transport, Arc::new(SharedSecretCodec))
    }

    /// Build a session with an explicit payload codec
    pub fn with_codec(
        config: ConnectConfig,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn RelayTransport>,
        codec: Arc<dyn MessageCodec>,
    ) -> Self {
        let identity = load_or_create_identity(store.as_ref());
        let remote = load_remote(store.as_ref());

        let initial = match remote {
            Some(remote) => {
                info!(%remote, "restored paired remote signer");
                PairingState::Connected { remote }
            }
            None => PairingState::Idle,
        };
        let (state, _) = watch::channel(initial);
        let correlator = Correlator::new(config.request_timeout());

        ConnectSession {
            inner: Arc::new(Inner {
                config,
                identity,
                store,
                transport,
                codec,
                correlator,
                state,
                remote: Mutex::new(remote),
                listener: tokio::sync::Mutex::new(None),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Local identity
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Local public key
    pub fn public_key(&self) -> &PublicKey {
        self.inner.identity.public_key()
    }

    /// The paired remote signer, if any
    pub fn remote_signer(&self) -> Option<PublicKey> {
        self.inner.remote()
    }

    /// Session configuration
    pub fn config(&self) -> &ConnectConfig {
        &self.inner.config
    }

    /// Pairing URI for this session
    pub fn connection_uri(&self) -> String {
        let config = &self.inner.config;
        build_connection_uri(
            &config.uri_scheme,
            self.public_key(),
            &config.relay_url,
            &config.metadata,
        )
    }

    /// Current pairing state
    pub fn state(&self) -> PairingState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn watch_state(&self) -> watch::Receiver<PairingState> {
        self.inner.state.subscribe()
    }

    /// Requests awaiting an answer
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Connect to the relay and listen for the signer's `connect`
    ///
    /// Safe to call again after an error. When a signer is already paired
    /// the subscription is reopened and the state stays connected.
    pub async fn begin_pairing(&self) -> ConnectResult<()> {
        self.inner.start_listening(None).await?;

        // held so a connect handled meanwhile cannot be overwritten
        let remote = self.inner.lock_remote();
        match *remote {
            Some(remote) => self.inner.set_state(PairingState::Connected { remote }),
            None => self.inner.set_state(PairingState::AwaitingApproval),
        }
        Ok(())
    }

    /// Send one request to the paired signer and wait for its answer
    pub async fn send_request(&self, method: Method, params: Vec<String>) -> ConnectResult<String> {
        let inner = &self.inner;
        let remote = inner.remote().ok_or(ConnectError::Unpaired)?;
        let id = inner.correlator.next_id();

        let epoch = inner.epoch.load(Ordering::SeqCst);
        if !inner.ensure_listening(epoch).await? {
            debug!(%id, "session shut down before the request was sent");
            return Err(ConnectError::Cancelled { id });
        }

        let pending = inner.correlator.register(id.clone());
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            // a shutdown ran while connecting and its cancel_all missed this one
            inner
                .correlator
                .settle(&id, Err(ConnectError::Cancelled { id: id.clone() }));
            return pending.wait().await;
        }

        let payload = Payload::Request {
            id: id.clone(),
            method: method.as_str().to_string(),
            params,
        };
        debug!(%id, %method, "sending request");

        match seal_envelope(
            &inner.identity,
            inner.codec.as_ref(),
            &remote,
            &inner.config.client_id,
            &payload,
        ) {
            Ok(envelope) => {
                if let Err(e) = inner.transport.publish(&envelope).await {
                    warn!(%id, "failed to publish request: {}", e);
                    let error = inner.fail(e.into());
                    inner.correlator.settle(&id, Err(error));
                }
            }
            Err(e) => {
                inner.correlator.settle(&id, Err(e.into()));
            }
        }

        pending.wait().await
    }

    /// Have the remote signer sign `event`
    pub async fn sign_event(&self, event: UnsignedEvent) -> ConnectResult<SignedEvent> {
        let params = vec![serde_json::to_string(&event)?];
        let value = self.send_request(Method::SignEvent, params).await?;

        let signed: SignedEvent = serde_json::from_str(&value)
            .map_err(|e| ConnectError::InvalidResponse(format!("not a signed event: {}", e)))?;
        signed
            .verify()
            .map_err(|e| ConnectError::InvalidResponse(e.to_string()))?;

        let unchanged = signed.kind == event.kind
            && signed.created_at == event.created_at
            && signed.tags == event.tags
            && signed.content == event.content;
        if !unchanged {
            return Err(ConnectError::InvalidResponse(
                "signed event differs from the request".to_string(),
            ));
        }

        info!(id = %signed.id, kind = signed.kind, "event signed remotely");
        Ok(signed)
    }

    /// Ask the remote signer for the user's public key
    pub async fn get_public_key(&self) -> ConnectResult<PublicKey> {
        let value = self.send_request(Method::GetPublicKey, Vec::new()).await?;
        PublicKey::from_hex(&value).map_err(|e| ConnectError::InvalidResponse(e.to_string()))
    }

    /// Round trip to the remote signer
    pub async fn ping(&self) -> ConnectResult<()> {
        let value = self.send_request(Method::Ping, Vec::new()).await?;
        if value != PONG {
            return Err(ConnectError::InvalidResponse(format!(
                "expected {:?}, got {:?}",
                PONG, value
            )));
        }
        Ok(())
    }

    /// Stop listening and close the relay connection, keeping the pairing
    ///
    /// Pending requests are cancelled. The next request reconnects. Without
    /// a paired signer nothing is left to wait for, so the state returns to
    /// [`PairingState::Idle`].
    pub async fn close(&self) {
        let inner = &self.inner;
        let cancelled = inner.shutdown().await;

        let remote = inner.lock_remote();
        if remote.is_none() {
            inner.set_state(PairingState::Idle);
        }
        drop(remote);
        debug!(cancelled, "session closed");
    }

    /// Forget the paired signer and return to [`PairingState::Idle`]
    ///
    /// Never fails and may be repeated. Pending requests are rejected with
    /// [`ConnectError::Cancelled`] before the subscription and then the
    /// connection are closed.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let cancelled = inner.shutdown().await;

        *inner.lock_remote() = None;
        if let Err(e) = inner.store.remove(REMOTE_SIGNER_KEY) {
            warn!("failed to clear paired signer: {}", e);
        }
        inner.set_state(PairingState::Idle);
        info!(cancelled, "disconnected from remote signer");
    }
}

impl std::fmt::Debug for ConnectSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectSession")
            .field("public_key", self.public_key())
            .field("relay", &self.inner.transport.relay_url())
            .field("state", &self.state())
            .finish()
    }
}

fn load_remote(store: &dyn KeyValueStore) -> Option<PublicKey> {
    let stored = store.get(REMOTE_SIGNER_KEY)?;
    match PublicKey::from_hex(&stored) {
        Ok(remote) => Some(remote),
        Err(e) => {
            warn!("ignoring malformed paired signer reference: {}", e);
            None
        }
    }
}

impl Inner {
    fn lock_remote(&self) -> std::sync::MutexGuard<'_, Option<PublicKey>> {
        self.remote.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remote(&self) -> Option<PublicKey> {
        *self.lock_remote()
    }

    fn set_state(&self, next: PairingState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            info!(from = %previous, to = %next, "pairing state changed");
        }
    }

    fn fail(&self, error: ConnectError) -> ConnectError {
        self.set_state(PairingState::Error {
            detail: error.to_string(),
        });
        error
    }

    /// Connect, subscribe and spawn the inbound loop, replacing any previous loop
    ///
    /// With `expected` set, returns `Ok(false)` without connecting once a
    /// shutdown has moved the epoch past it.
    async fn start_listening(self: &Arc<Self>, expected: Option<u64>) -> ConnectResult<bool> {
        let mut listener = self.listener.lock().await;
        if expected.is_some_and(|epoch| epoch != self.epoch.load(Ordering::SeqCst)) {
            return Ok(false);
        }
        if let Some(previous) = listener.take() {
            stop(previous).await;
        }

        if let Err(e) = self.transport.ensure_connected().await {
            warn!(relay = %self.transport.relay_url(), "relay connection failed: {}", e);
            return Err(self.fail(e.into()));
        }
        let subscription = self
            .transport
            .subscribe(inbound_filter(self.identity.public_key()))
            .await
            .map_err(|e| self.fail(e.into()))?;

        debug!(sub = %subscription.id(), "listening for remote signer");
        *listener = Some(tokio::spawn(run_inbound(
            Arc::downgrade(self),
            subscription,
        )));
        Ok(true)
    }

    /// Start listening unless a live loop already exists
    async fn ensure_listening(self: &Arc<Self>, epoch: u64) -> ConnectResult<bool> {
        {
            let listener = self.listener.lock().await;
            let live = listener.as_ref().map_or(false, |h| !h.is_finished());
            if live && self.transport.is_connected() {
                return Ok(epoch == self.epoch.load(Ordering::SeqCst));
            }
        }
        self.start_listening(Some(epoch)).await
    }

    /// Cancel pending requests, stop the loop and close the transport
    ///
    /// The listener lock is held throughout, so a request still connecting
    /// either finishes first and is cancelled here or sees the new epoch.
    async fn shutdown(&self) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.listener.lock().await;

        let mut cancelled = self.correlator.cancel_all();
        if let Some(listener) = guard.take() {
            stop(listener).await;
        }
        self.transport.teardown().await;
        cancelled += self.correlator.cancel_all();
        cancelled
    }

    async fn handle_inbound(&self, event: SignedEvent) {
        if event.kind != CONNECT_EVENT_KIND {
            debug!(kind = event.kind, "ignoring event of unrelated kind");
            return;
        }

        let payload = match open_envelope(&self.identity, self.codec.as_ref(), &event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id = %event.id, from = %event.pubkey, "dropping undecodable message: {}", e);
                self.set_state(PairingState::Error {
                    detail: ConnectError::from(e).to_string(),
                });
                return;
            }
        };
        debug!(from = %event.pubkey, kind = payload.kind_name(), id = payload.id(), "inbound message");

        match payload {
            Payload::Connect { id } => self.handle_connect(event.pubkey, id).await,
            Payload::Result { id, value } => self.handle_response(&event.pubkey, &id, Ok(value)),
            Payload::Error { id, message } => {
                self.handle_response(&event.pubkey, &id, Err(ConnectError::Remote(message)))
            }
            Payload::Request { method, .. } => {
                debug!(%method, "ignoring request from remote side");
            }
        }
    }

    async fn handle_connect(&self, sender: PublicKey, id: String) {
        match self.remote() {
            Some(remote) if remote != sender => {
                warn!(%sender, paired = %remote, "rejecting connect from a second signer");
                return;
            }
            Some(_) => debug!(%sender, "paired signer reconnected"),
            None => {
                if let Err(e) = self.store.set(REMOTE_SIGNER_KEY, &sender.to_hex()) {
                    warn!("failed to persist paired signer: {}", e);
                }
                *self.lock_remote() = Some(sender);
                info!(%sender, "paired with remote signer");
            }
        }

        let ack = Payload::Result {
            id,
            value: CONNECT_ACK.to_string(),
        };
        let published = match seal_envelope(
            &self.identity,
            self.codec.as_ref(),
            &sender,
            &self.config.client_id,
            &ack,
        ) {
            Ok(envelope) => self.transport.publish(&envelope).await.map_err(ConnectError::from),
            Err(e) => Err(e.into()),
        };

        match published {
            Ok(()) => self.set_state(PairingState::Connected { remote: sender }),
            Err(e) => {
                warn!("failed to acknowledge connect: {}", e);
                self.fail(e);
            }
        }
    }

    fn handle_response(&self, sender: &PublicKey, id: &str, outcome: ConnectResult<String>) {
        let Some(remote) = self.remote().filter(|remote| remote == sender) else {
            debug!(%sender, %id, "dropping response from unpaired sender");
            return;
        };

        if !self.correlator.settle(id, outcome) {
            debug!(%id, "no pending request, discarding response");
        }

        // a verified message from the signer means the channel works again
        if matches!(*self.state.borrow(), PairingState::Error { .. }) {
            self.set_state(PairingState::Connected { remote });
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

/// Abort the inbound loop and wait until it can no longer touch state
async fn stop(listener: JoinHandle<()>) {
    listener.abort();
    let _ = listener.await;
}

async fn run_inbound(session: Weak<Inner>, mut subscription: Subscription) {
    while let Some(item) = subscription.next().await {
        let Some(inner) = session.upgrade() else {
            return;
        };
        match item {
            Ok(event) => inner.handle_inbound(event).await,
            Err(e) => {
                warn!(sub = %subscription.id(), "unreadable relay event: {}", e);
                let error = ConnectError::from(DecodeError::Envelope(e.to_string()));
                inner.set_state(PairingState::Error {
                    detail: error.to_string(),
                });
            }
        }
    }

    // the loop is aborted before any deliberate teardown
    if let Some(inner) = session.upgrade() {
        warn!(sub = %subscription.id(), "relay subscription ended");
        inner.set_state(PairingState::Error {
            detail: "relay connection closed".to_string(),
        });
    }
}
