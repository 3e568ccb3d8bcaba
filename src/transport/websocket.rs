//! WebSocket transport to a public relay
//!
//! Client messages are JSON arrays: `["EVENT", event]`,
//! `["REQ", sub_id, filter]`, `["CLOSE", sub_id]`. The relay answers with
//! `EVENT`, `EOSE`, `OK`, `NOTICE` and `CLOSED`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Filter, RelayTransport, Subscription, TransportError, TransportResult};
use crate::event::SignedEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Messages a relay sends to clients
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayMessage {
    /// An event matching one of our subscriptions
    Event {
        subscription_id: String,
        event: Box<SignedEvent>,
    },
    /// Stored events for a subscription are exhausted
    EndOfStored { subscription_id: String },
    /// Acceptance verdict for a published event
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// Human-readable relay notice
    Notice { message: String },
    /// The relay closed a subscription
    Closed {
        subscription_id: String,
        message: String,
    },
}

impl RelayMessage {
    /// Parse one relay text frame
    pub fn parse(text: &str) -> TransportResult<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| TransportError::InvalidData(e.to_string()))?;
        let items = value
            .as_array()
            .ok_or_else(|| TransportError::InvalidData("relay message is not an array".into()))?;

        let text_at = |i: usize| -> TransportResult<String> {
            items
                .get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| TransportError::InvalidData(format!("missing string at {}", i)))
        };

        match text_at(0)?.as_str() {
            "EVENT" => {
                let raw = items
                    .get(2)
                    .cloned()
                    .ok_or_else(|| TransportError::InvalidData("EVENT without event".into()))?;
                let event = serde_json::from_value(raw)
                    .map_err(|e| TransportError::InvalidData(e.to_string()))?;
                Ok(RelayMessage::Event {
                    subscription_id: text_at(1)?,
                    event: Box::new(event),
                })
            }
            "EOSE" => Ok(RelayMessage::EndOfStored {
                subscription_id: text_at(1)?,
            }),
            "OK" => Ok(RelayMessage::Ok {
                event_id: text_at(1)?,
                accepted: items.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: text_at(3).unwrap_or_default(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: text_at(1)?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: text_at(1)?,
                message: text_at(2).unwrap_or_default(),
            }),
            other => Err(TransportError::InvalidData(format!(
                "unknown relay message type: {}",
                other
            ))),
        }
    }
}

fn event_frame(event: &SignedEvent) -> String {
    serde_json::json!(["EVENT", event]).to_string()
}

fn req_frame(sub_id: &str, filter: &Filter) -> String {
    serde_json::json!(["REQ", sub_id, filter]).to_string()
}

fn close_frame(sub_id: &str) -> String {
    serde_json::json!(["CLOSE", sub_id]).to_string()
}

struct Route {
    sub_id: String,
    tx: mpsc::UnboundedSender<TransportResult<SignedEvent>>,
}

struct Connection {
    sink: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
}

fn lock_route(route: &Mutex<Option<Route>>) -> MutexGuard<'_, Option<Route>> {
    route.lock().unwrap_or_else(PoisonError::into_inner)
}

/// WebSocket connection to one relay
pub struct WebSocketRelay {
    url: String,
    connection: tokio::sync::Mutex<Option<Connection>>,
    route: Arc<Mutex<Option<Route>>>,
    connected: Arc<AtomicBool>,
    next_sub: AtomicU64,
}

impl WebSocketRelay {
    /// A transport for `url`; nothing is opened until first use
    pub fn new(url: impl Into<String>) -> Self {
        WebSocketRelay {
            url: url.into(),
            connection: tokio::sync::Mutex::new(None),
            route: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            next_sub: AtomicU64::new(0),
        }
    }

    async fn send_text(connection: &mut Connection, text: String) -> TransportResult<()> {
        connection
            .sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Subscription id of an `EVENT` frame, readable even when the event is not
fn event_subscription(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let items = value.as_array()?;
    if items.first()?.as_str()? != "EVENT" {
        return None;
    }
    items.get(1)?.as_str().map(str::to_string)
}

/// Handle one relay text frame
fn dispatch(text: &str, route: &Mutex<Option<Route>>) {
    match RelayMessage::parse(text) {
        Ok(RelayMessage::Event {
            subscription_id,
            event,
        }) => {
            let guard = lock_route(route);
            match guard.as_ref() {
                Some(r) if r.sub_id == subscription_id => {
                    let _ = r.tx.send(Ok(*event));
                }
                _ => debug!(sub = %subscription_id, "event for stale subscription"),
            }
        }
        Ok(RelayMessage::EndOfStored { subscription_id }) => {
            debug!(sub = %subscription_id, "end of stored events");
        }
        Ok(RelayMessage::Ok {
            event_id,
            accepted,
            message,
        }) => {
            if !accepted {
                warn!(id = %event_id, "relay rejected event: {}", message);
            }
        }
        Ok(RelayMessage::Notice { message }) => info!("relay notice: {}", message),
        Ok(RelayMessage::Closed {
            subscription_id,
            message,
        }) => {
            warn!(sub = %subscription_id, "relay closed subscription: {}", message);
            let mut guard = lock_route(route);
            if guard.as_ref().is_some_and(|r| r.sub_id == subscription_id) {
                guard.take();
            }
        }
        Err(e) => match event_subscription(text) {
            Some(subscription_id) => {
                let guard = lock_route(route);
                match guard.as_ref() {
                    Some(r) if r.sub_id == subscription_id => {
                        warn!(sub = %subscription_id, "malformed event frame: {}", e);
                        let _ = r.tx.send(Err(e));
                    }
                    _ => debug!(sub = %subscription_id, "malformed event for stale subscription"),
                }
            }
            None => debug!("ignoring relay frame: {}", e),
        },
    }
}

/// Route inbound frames until the connection ends
async fn read_frames(
    mut stream: SplitStream<WsStream>,
    route: Arc<Mutex<Option<Route>>>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("relay read failed: {}", e);
                break;
            }
        };

        dispatch(&text, &route);
    }

    connected.store(false, Ordering::SeqCst);
    // dropping the sender ends the live subscription stream
    lock_route(&route).take();
    debug!("relay connection closed");
}

#[async_trait]
impl RelayTransport for WebSocketRelay {
    fn relay_url(&self) -> &str {
        &self.url
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ensure_connected(&self) -> TransportResult<()> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() && self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = connection.take() {
            stale.reader.abort();
        }

        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (sink, stream) = ws.split();

        self.connected.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(read_frames(
            stream,
            self.route.clone(),
            self.connected.clone(),
        ));
        *connection = Some(Connection { sink, reader });

        info!(relay = %self.url, "connected to relay");
        Ok(())
    }

    async fn publish(&self, event: &SignedEvent) -> TransportResult<()> {
        let mut connection = self.connection.lock().await;
        let conn = connection.as_mut().ok_or(TransportError::Disconnected)?;
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        Self::send_text(conn, event_frame(event)).await
    }

    async fn subscribe(&self, filter: Filter) -> TransportResult<Subscription> {
        let mut connection = self.connection.lock().await;
        let conn = connection.as_mut().ok_or(TransportError::Disconnected)?;
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let previous = lock_route(&self.route).take();
        if let Some(previous) = previous {
            Self::send_text(conn, close_frame(&previous.sub_id)).await?;
        }

        let n = self.next_sub.fetch_add(1, Ordering::SeqCst) + 1;
        let sub_id = format!("rs-{}", n);
        let (tx, rx) = mpsc::unbounded_channel();
        *lock_route(&self.route) = Some(Route {
            sub_id: sub_id.clone(),
            tx,
        });

        if let Err(e) = Self::send_text(conn, req_frame(&sub_id, &filter)).await {
            lock_route(&self.route).take();
            return Err(e);
        }

        debug!(sub = %sub_id, "subscribed");
        Ok(Subscription::new(sub_id, rx))
    }

    async fn teardown(&self) {
        let mut connection = self.connection.lock().await;
        let route = lock_route(&self.route).take();

        if let Some(mut conn) = connection.take() {
            if let Some(route) = route {
                if let Err(e) = Self::send_text(&mut conn, close_frame(&route.sub_id)).await {
                    debug!("could not close subscription cleanly: {}", e);
                }
            }
            if let Err(e) = conn.sink.close().await {
                debug!("could not close relay connection cleanly: {}", e);
            }
            conn.reader.abort();
            info!(relay = %self.url, "disconnected from relay");
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use crate::event::UnsignedEvent;

    #[test]
    fn test_parse_event_frame() {
        let event = UnsignedEvent::new(24133, vec![], "cipher").sign(&Identity::generate());
        let frame = serde_json::json!(["EVENT", "rs-1", event]).to_string();

        match RelayMessage::parse(&frame).unwrap() {
            RelayMessage::Event {
                subscription_id,
                event: parsed,
            } => {
                assert_eq!(subscription_id, "rs-1");
                assert_eq!(*parsed, event);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_control_frames() {
        assert_eq!(
            RelayMessage::parse(r#"["EOSE","rs-1"]"#).unwrap(),
            RelayMessage::EndOfStored {
                subscription_id: "rs-1".into()
            }
        );
        assert_eq!(
            RelayMessage::parse(r#"["OK","abc",false,"blocked: spam"]"#).unwrap(),
            RelayMessage::Ok {
                event_id: "abc".into(),
                accepted: false,
                message: "blocked: spam".into()
            }
        );
        assert_eq!(
            RelayMessage::parse(r#"["NOTICE","slow down"]"#).unwrap(),
            RelayMessage::Notice {
                message: "slow down".into()
            }
        );
        assert_eq!(
            RelayMessage::parse(r#"["CLOSED","rs-2"]"#).unwrap(),
            RelayMessage::Closed {
                subscription_id: "rs-2".into(),
                message: String::new()
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RelayMessage::parse("not json").is_err());
        assert!(RelayMessage::parse(r#"{"EVENT":1}"#).is_err());
        assert!(RelayMessage::parse(r#"["AUTH","challenge"]"#).is_err());
        assert!(RelayMessage::parse(r#"["EVENT","rs-1",{"id":1}]"#).is_err());
    }

    #[test]
    fn test_client_frames() {
        let filter = Filter {
            kinds: vec![24133],
            recipients: vec!["ab".into()],
            since: Some(10),
        };

        assert_eq!(
            req_frame("rs-1", &filter),
            r##"["REQ","rs-1",{"#p":["ab"],"kinds":[24133],"since":10}]"##
        );
        assert_eq!(close_frame("rs-1"), r#"["CLOSE","rs-1"]"#);
        assert!(event_frame(
            &UnsignedEvent::new(1, vec![], "").sign(&Identity::generate())
        )
        .starts_with(r#"["EVENT",{"#));
    }

    type Inbox = mpsc::UnboundedReceiver<TransportResult<SignedEvent>>;

    fn routed(sub_id: &str) -> (Mutex<Option<Route>>, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let route = Mutex::new(Some(Route {
            sub_id: sub_id.into(),
            tx,
        }));
        (route, rx)
    }

    #[test]
    fn test_dispatch_routes_events_to_live_subscription() {
        let (route, mut rx) = routed("rs-1");
        let event = UnsignedEvent::new(24133, vec![], "cipher").sign(&Identity::generate());

        dispatch(&serde_json::json!(["EVENT", "rs-1", event]).to_string(), &route);
        dispatch(&serde_json::json!(["EVENT", "rs-0", event]).to_string(), &route);
        dispatch(r#"["NOTICE","hi"]"#, &route);

        assert_eq!(rx.try_recv().unwrap(), Ok(event));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_surfaces_malformed_event() {
        let (route, mut rx) = routed("rs-1");

        dispatch(r#"["EVENT","rs-1",{"id":1}]"#, &route);
        dispatch(r#"["EVENT","rs-0",{"id":1}]"#, &route);
        dispatch("not json", &route);

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(TransportError::InvalidData(_))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_closed_drops_route() {
        let (route, mut rx) = routed("rs-1");

        dispatch(r#"["CLOSED","rs-1","auth-required"]"#, &route);

        assert!(lock_route(&route).is_none());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_unconnected_operations_fail_and_teardown_is_safe() {
        let relay = WebSocketRelay::new("ws://127.0.0.1:9");
        let event = UnsignedEvent::new(1, vec![], "").sign(&Identity::generate());

        assert!(!relay.is_connected());
        assert_eq!(relay.publish(&event).await, Err(TransportError::Disconnected));
        assert!(relay.subscribe(Filter::default()).await.is_err());

        relay.teardown().await;
        relay.teardown().await;
        assert_eq!(relay.relay_url(), "ws://127.0.0.1:9");
    }
}
