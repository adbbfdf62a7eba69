//! One pooled relay connection: a websocket plus its socket task.
//!
//! Each `RelayConnection` owns exactly one duplex socket to exactly one
//! relay. The socket lives in a spawned task; callers talk to it through an
//! outbound message channel and read from a broadcast of parsed relay
//! messages. The task reports its own death back to the pool so the record
//! can be retired and the health monitor informed.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use nostr::message::{ClientMessage, RelayMessage};
use nostr::{Event, EventId, Filter, JsonUtil, RelayUrl, SubscriptionId};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::DialError;

/// Identifier for one pooled connection, unique within a pool.
pub type ConnectionId = u64;

/// Outbound message queue depth per connection.
const OUTBOUND_QUEUE: usize = 64;

/// Incoming broadcast buffer per connection. Subscription routers that fall
/// behind by this much start losing messages (and log it).
const INCOMING_QUEUE: usize = 4096;

/// Parsed messages delivered from the socket task to subscribers.
#[derive(Debug, Clone)]
pub enum RelayIncoming {
    /// An event matching one of our subscriptions.
    Event {
        subscription_id: SubscriptionId,
        event: Box<Event>,
    },
    /// End of stored events for a subscription.
    EndOfStoredEvents { subscription_id: SubscriptionId },
    /// Command result (EVENT/AUTH acceptance).
    Ok {
        event_id: EventId,
        accepted: bool,
        message: String,
    },
    /// The relay closed one of our subscriptions.
    Closed {
        subscription_id: SubscriptionId,
        message: String,
    },
    /// NIP-42 challenge.
    AuthChallenge { challenge: String },
    /// Human-readable notice.
    Notice { message: String },
    /// The socket is gone. Always the final message on a connection.
    Disconnected { reason: String },
}

/// Notification sent to the pool when a socket task ends.
#[derive(Debug)]
pub(crate) struct SocketClosed {
    pub endpoint: RelayUrl,
    pub id: ConnectionId,
    pub reason: String,
    /// True when this client asked for the close.
    pub initiated_locally: bool,
}

/// Mutable lease bookkeeping, guarded by a short-lived lock.
struct LeaseState {
    last_used: Instant,
    open_subscriptions: usize,
    healthy: bool,
}

/// A pooled connection to a single relay.
pub struct RelayConnection {
    id: ConnectionId,
    endpoint: RelayUrl,
    created_at: Instant,
    outbound: mpsc::Sender<String>,
    incoming: broadcast::Sender<RelayIncoming>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    state: Mutex<LeaseState>,
    /// Stub connections keep the outbound receiver so sends can be asserted.
    #[cfg(test)]
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl RelayConnection {
    /// The connection's pool-unique id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The relay this connection belongs to.
    pub fn endpoint(&self) -> &RelayUrl {
        &self.endpoint
    }

    /// When the socket was established.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Subscribe to parsed messages from this connection.
    pub fn subscribe_incoming(&self) -> broadcast::Receiver<RelayIncoming> {
        self.incoming.subscribe()
    }

    /// True once the socket is gone or a close has been requested. Checked on
    /// the event-routing path so a `close_all` stops delivery immediately.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of subscriptions currently leased on this connection.
    pub fn open_subscriptions(&self) -> usize {
        self.state.lock().open_subscriptions
    }

    /// True when no subscription is leased.
    pub fn is_idle(&self) -> bool {
        self.open_subscriptions() == 0
    }

    /// How long since this connection was last leased or used.
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_used.elapsed()
    }

    /// Mirror of the health monitor's last verdict for this endpoint.
    pub fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.state.lock().healthy = healthy;
    }

    pub(crate) fn lease(&self) {
        let mut state = self.state.lock();
        state.open_subscriptions += 1;
        state.last_used = Instant::now();
    }

    pub(crate) fn end_lease(&self) {
        let mut state = self.state.lock();
        state.open_subscriptions = state.open_subscriptions.saturating_sub(1);
        state.last_used = Instant::now();
    }

    /// Request the socket task to close. Idempotent; flips the closed flag
    /// synchronously so no further events are routed from this connection.
    pub(crate) fn signal_close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.close_tx.send(true);
        }
    }

    /// Send a REQ for the given subscription.
    pub async fn send_req(&self, id: &SubscriptionId, filter: &Filter) -> crate::Result<()> {
        self.send(ClientMessage::Req {
            subscription_id: Cow::Borrowed(id),
            filter: Cow::Borrowed(filter),
        })
        .await
    }

    /// Send a CLOSE for the given subscription.
    pub async fn send_close_sub(&self, id: &SubscriptionId) -> crate::Result<()> {
        self.send(ClientMessage::Close(Cow::Borrowed(id))).await
    }

    /// Send a NIP-42 AUTH response event.
    pub async fn send_auth(&self, event: &Event) -> crate::Result<()> {
        self.send(ClientMessage::Auth(Cow::Borrowed(event))).await
    }

    /// Best-effort synchronous send, used on teardown paths where awaiting
    /// queue space is not worth it.
    pub(crate) fn try_send(&self, msg: ClientMessage<'_>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.try_send(msg.as_json()).is_ok()
    }

    /// Serialize and queue a client message for the socket task.
    pub async fn send(&self, msg: ClientMessage<'_>) -> crate::Result<()> {
        if self.is_closed() {
            return Err(crate::Error::Websocket(format!(
                "connection to {} is closed",
                self.endpoint
            )));
        }
        self.state.lock().last_used = Instant::now();
        self.outbound
            .send(msg.as_json())
            .await
            .map_err(|_| crate::Error::Websocket(format!("socket task for {} gone", self.endpoint)))
    }

    /// Build a connection record without a socket task (tests only).
    #[cfg(test)]
    pub(crate) fn stub(id: ConnectionId, endpoint: RelayUrl) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (incoming, _) = broadcast::channel(INCOMING_QUEUE);
        let (close_tx, _close_rx) = watch::channel(false);
        Arc::new(Self {
            id,
            endpoint,
            created_at: Instant::now(),
            outbound,
            incoming,
            closed: AtomicBool::new(false),
            close_tx,
            state: Mutex::new(LeaseState {
                last_used: Instant::now(),
                open_subscriptions: 0,
                healthy: true,
            }),
            outbound_rx: Mutex::new(Some(outbound_rx)),
        })
    }

    /// Drain messages queued on a stub connection (tests only).
    #[cfg(test)]
    pub(crate) fn drain_sent(&self) -> Vec<String> {
        let mut guard = self.outbound_rx.lock();
        let mut out = Vec::new();
        if let Some(rx) = guard.as_mut() {
            while let Ok(msg) = rx.try_recv() {
                out.push(msg);
            }
        }
        out
    }

    /// Inject an incoming message as if the relay had sent it (tests only).
    #[cfg(test)]
    pub(crate) fn inject_incoming(&self, msg: RelayIncoming) {
        let _ = self.incoming.send(msg);
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.to_string())
            .field("open_subscriptions", &self.open_subscriptions())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Dial the relay and spawn its socket task.
///
/// Returns the connection record and the handshake latency.
pub(crate) async fn establish(
    id: ConnectionId,
    endpoint: RelayUrl,
    timeout: Duration,
    closed_tx: mpsc::UnboundedSender<SocketClosed>,
) -> Result<(Arc<RelayConnection>, Duration), DialError> {
    let started = Instant::now();
    let url = endpoint.to_string();

    let ws = match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => return Err(DialError::Failed(e.to_string())),
        Err(_) => return Err(DialError::Timeout(timeout)),
    };
    let latency = started.elapsed();

    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (incoming, _) = broadcast::channel(INCOMING_QUEUE);
    let (close_tx, close_rx) = watch::channel(false);

    let conn = Arc::new(RelayConnection {
        id,
        endpoint,
        created_at: Instant::now(),
        outbound,
        incoming,
        closed: AtomicBool::new(false),
        close_tx,
        state: Mutex::new(LeaseState {
            last_used: Instant::now(),
            open_subscriptions: 0,
            healthy: true,
        }),
        #[cfg(test)]
        outbound_rx: Mutex::new(None),
    });

    tokio::spawn(run_socket(Arc::clone(&conn), ws, outbound_rx, close_rx, closed_tx));

    Ok((conn, latency))
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// The socket task: pumps outbound messages, parses incoming frames, answers
/// pings, and reports its own death.
async fn run_socket(
    conn: Arc<RelayConnection>,
    ws: WsStream,
    mut outbound_rx: mpsc::Receiver<String>,
    mut close_rx: watch::Receiver<bool>,
    closed_tx: mpsc::UnboundedSender<SocketClosed>,
) {
    let (mut sink, mut stream) = ws.split();
    let reason: String;
    let initiated_locally: bool;

    loop {
        tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    reason = "closed by client".to_string();
                    initiated_locally = true;
                    break;
                }
            }
            maybe = outbound_rx.recv() => {
                match maybe {
                    Some(text) => {
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            reason = format!("send failed: {}", e);
                            initiated_locally = false;
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        reason = "connection handle dropped".to_string();
                        initiated_locally = true;
                        break;
                    }
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => handle_text(&conn, &text),
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        reason = match frame {
                            Some(f) if !f.reason.is_empty() => {
                                format!("closed by relay: {}", f.reason)
                            }
                            _ => "closed by relay".to_string(),
                        };
                        initiated_locally = false;
                        break;
                    }
                    Some(Ok(_)) => {} // binary/pong frames are ignored
                    Some(Err(e)) => {
                        reason = format!("read failed: {}", e);
                        initiated_locally = false;
                        break;
                    }
                    None => {
                        reason = "stream ended".to_string();
                        initiated_locally = false;
                        break;
                    }
                }
            }
        }
    }

    conn.closed.store(true, Ordering::SeqCst);
    let _ = conn.incoming.send(RelayIncoming::Disconnected {
        reason: reason.clone(),
    });
    let _ = closed_tx.send(SocketClosed {
        endpoint: conn.endpoint.clone(),
        id: conn.id,
        reason,
        initiated_locally,
    });
}

/// Parse one relay frame and fan it out to subscribers.
fn handle_text(conn: &RelayConnection, text: &str) {
    let incoming = match RelayMessage::from_json(text) {
        Ok(RelayMessage::Event {
            subscription_id,
            event,
        }) => RelayIncoming::Event {
            subscription_id: subscription_id.into_owned(),
            event: Box::new(event.into_owned()),
        },
        Ok(RelayMessage::EndOfStoredEvents(subscription_id)) => RelayIncoming::EndOfStoredEvents {
            subscription_id: subscription_id.into_owned(),
        },
        Ok(RelayMessage::Ok {
            event_id,
            status,
            message,
        }) => RelayIncoming::Ok {
            event_id,
            accepted: status,
            message: message.to_string(),
        },
        Ok(RelayMessage::Closed {
            subscription_id,
            message,
        }) => RelayIncoming::Closed {
            subscription_id: subscription_id.into_owned(),
            message: message.to_string(),
        },
        Ok(RelayMessage::Auth { challenge }) => RelayIncoming::AuthChallenge {
            challenge: challenge.to_string(),
        },
        Ok(RelayMessage::Notice(message)) => RelayIncoming::Notice {
            message: message.to_string(),
        },
        Ok(_) => return, // COUNT / negentropy frames: not used by this layer
        Err(e) => {
            tracing::debug!(endpoint = %conn.endpoint, error = %e, "unparseable relay message");
            return;
        }
    };

    // Lagging subscribers lose messages; receiver side logs it.
    let _ = conn.incoming.send(incoming);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_bookkeeping() {
        let endpoint = RelayUrl::parse("wss://relay.example.com").unwrap();
        let conn = RelayConnection::stub(1, endpoint);

        assert!(conn.is_idle());
        conn.lease();
        conn.lease();
        assert_eq!(conn.open_subscriptions(), 2);
        assert!(!conn.is_idle());

        conn.end_lease();
        conn.end_lease();
        assert!(conn.is_idle());

        // Underflow protection
        conn.end_lease();
        assert_eq!(conn.open_subscriptions(), 0);
    }

    #[test]
    fn test_signal_close_is_idempotent() {
        let endpoint = RelayUrl::parse("wss://relay.example.com").unwrap();
        let conn = RelayConnection::stub(1, endpoint);

        assert!(!conn.is_closed());
        conn.signal_close();
        assert!(conn.is_closed());
        conn.signal_close();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_send_on_closed_connection_fails() {
        let endpoint = RelayUrl::parse("wss://relay.example.com").unwrap();
        let conn = RelayConnection::stub(1, endpoint);
        conn.signal_close();

        let id = SubscriptionId::new("feed");
        let err = conn.send_close_sub(&id).await.unwrap_err();
        assert!(matches!(err, crate::Error::Websocket(_)));
    }
}
