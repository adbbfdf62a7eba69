//! Relay connection pool.
//!
//! Owns every duplex socket the client holds, with bounded fan-out:
//! - at most `max_connections_per_relay` records per endpoint and
//!   `max_total_connections` overall; exceeding either is a capacity error
//!   the caller treats as "skip this relay for now"
//! - `acquire` reuses an idle healthy record before dialing, and concurrent
//!   acquires for the same endpoint share a single in-flight dial
//! - a background sweep retires records idle longer than `max_idle`
//!
//! Every open and close is reported to the health monitor; the pool is the
//! only component that ever closes a socket.

mod connection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::{counter, gauge};
use nostr::RelayUrl;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub use connection::{ConnectionId, RelayConnection, RelayIncoming};
use connection::SocketClosed;

use crate::health::HealthMonitor;
use crate::{Error, Result};

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrent connections per relay.
    pub max_connections_per_relay: usize,
    /// Maximum concurrent connections across all relays.
    pub max_total_connections: usize,
    /// Maximum subscriptions multiplexed onto one connection before the pool
    /// prefers opening another record to the same relay.
    pub max_subscriptions_per_connection: usize,
    /// Dial budget for establishing a connection.
    pub connection_timeout: Duration,
    /// How often the idle sweep runs.
    pub idle_cleanup_interval: Duration,
    /// Idle age beyond which a connection is retired.
    pub max_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_relay: 3,
            max_total_connections: 20,
            max_subscriptions_per_connection: 16,
            connection_timeout: Duration::from_secs(10),
            idle_cleanup_interval: Duration::from_secs(60),
            max_idle: Duration::from_secs(300),
        }
    }
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total open connections.
    pub total: usize,
    /// Connections with at least one open subscription.
    pub active: usize,
    /// Connections with no open subscription.
    pub idle: usize,
    /// Open connection count per relay.
    pub per_relay: HashMap<RelayUrl, usize>,
}

/// Why a dial did not produce a connection. Cloneable so the result can be
/// broadcast to every caller that joined the in-flight dial.
#[derive(Debug, Clone)]
pub(crate) enum DialError {
    Timeout(Duration),
    Failed(String),
}

impl DialError {
    fn describe(&self) -> String {
        match self {
            Self::Timeout(t) => format!("dial timed out after {:?}", t),
            Self::Failed(reason) => reason.clone(),
        }
    }

    fn into_error(self, endpoint: RelayUrl) -> Error {
        match self {
            Self::Timeout(timeout) => Error::ConnectionTimeout { endpoint, timeout },
            Self::Failed(reason) => Error::ConnectionFailed { endpoint, reason },
        }
    }
}

type DialResult = std::result::Result<ConnectionId, DialError>;

struct PoolInner {
    connections: HashMap<RelayUrl, Vec<Arc<RelayConnection>>>,
    pending_dials: HashMap<RelayUrl, broadcast::Sender<DialResult>>,
    total: usize,
}

/// The connection pool. Construct once via [`ConnectionPool::new`] and share
/// by `Arc`.
pub struct ConnectionPool {
    config: PoolConfig,
    health: Arc<HealthMonitor>,
    inner: Mutex<PoolInner>,
    closed_tx: mpsc::UnboundedSender<SocketClosed>,
    next_id: AtomicU64,
    /// Self-reference so dials can run in their own task: an in-flight dial
    /// must survive the cancellation of whichever caller started it.
    weak_self: Weak<Self>,
}

impl ConnectionPool {
    /// Create a pool and start its socket-retirement task.
    pub fn new(config: PoolConfig, health: Arc<HealthMonitor>) -> Arc<Self> {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let pool = Arc::new_cyclic(|weak| Self {
            config,
            health,
            inner: Mutex::new(PoolInner {
                connections: HashMap::new(),
                pending_dials: HashMap::new(),
                total: 0,
            }),
            closed_tx,
            next_id: AtomicU64::new(1),
            weak_self: weak.clone(),
        });

        Self::spawn_reaper(Arc::downgrade(&pool), closed_rx);
        pool
    }

    /// Get the configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire a connection to `endpoint`: reuse an idle healthy record,
    /// join an in-flight dial, or open a new socket under the caps.
    ///
    /// Capacity and dial failures are skippable per-relay errors.
    pub async fn acquire(&self, endpoint: &RelayUrl) -> Result<Arc<RelayConnection>> {
        enum Step {
            Reuse(Arc<RelayConnection>),
            Wait(broadcast::Receiver<DialResult>),
        }

        let step = {
            let mut inner = self.inner.lock();

            if let Some(conn) = self.pick_reusable(&inner, endpoint) {
                conn.lease();
                Step::Reuse(conn)
            } else if let Some(tx) = inner.pending_dials.get(endpoint) {
                Step::Wait(tx.subscribe())
            } else {
                let per_relay = inner.connections.get(endpoint).map(Vec::len).unwrap_or(0);
                if per_relay >= self.config.max_connections_per_relay {
                    counter!("relay_pool_capacity_rejections_total", "scope" => "relay")
                        .increment(1);
                    return Err(Error::CapacityExceeded {
                        endpoint: endpoint.clone(),
                        reason: format!(
                            "per-relay cap reached ({}/{})",
                            per_relay, self.config.max_connections_per_relay
                        ),
                    });
                }
                let in_flight = inner.total + inner.pending_dials.len();
                if in_flight >= self.config.max_total_connections {
                    counter!("relay_pool_capacity_rejections_total", "scope" => "global")
                        .increment(1);
                    return Err(Error::CapacityExceeded {
                        endpoint: endpoint.clone(),
                        reason: format!(
                            "global cap reached ({}/{})",
                            in_flight, self.config.max_total_connections
                        ),
                    });
                }

                let Some(pool) = self.weak_self.upgrade() else {
                    return Err(Error::ConnectionFailed {
                        endpoint: endpoint.clone(),
                        reason: "pool is shutting down".to_string(),
                    });
                };
                let (tx, _) = broadcast::channel(1);
                // Subscribe before the dial task exists so its result cannot
                // be missed.
                let rx = tx.subscribe();
                inner.pending_dials.insert(endpoint.clone(), tx.clone());
                tokio::spawn(pool.run_dial(endpoint.clone(), tx));
                Step::Wait(rx)
            }
        };

        match step {
            Step::Reuse(conn) => Ok(conn),
            Step::Wait(mut rx) => match rx.recv().await {
                Ok(Ok(id)) => self.lease_by_id(endpoint, id).ok_or_else(|| {
                    Error::ConnectionFailed {
                        endpoint: endpoint.clone(),
                        reason: "connection closed before it could be shared".to_string(),
                    }
                }),
                Ok(Err(dial_err)) => Err(dial_err.into_error(endpoint.clone())),
                Err(_) => Err(Error::ConnectionFailed {
                    endpoint: endpoint.clone(),
                    reason: "in-flight dial abandoned".to_string(),
                }),
            },
        }
    }

    /// Return a leased connection. The record stays open for reuse; the idle
    /// sweep retires it if nobody comes back for it.
    pub fn release(&self, endpoint: &RelayUrl, conn: &RelayConnection) {
        debug_assert_eq!(conn.endpoint(), endpoint);
        conn.end_lease();
    }

    /// Close every connection to `endpoint`. Idempotent; events stop being
    /// delivered from these records synchronously.
    pub fn close_all(&self, endpoint: &RelayUrl, reason: &str) {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.connections.remove(endpoint) {
                Some(records) => {
                    inner.total = inner.total.saturating_sub(records.len());
                    records
                }
                None => return,
            }
        };

        for conn in &removed {
            conn.signal_close();
        }
        counter!("relay_pool_disconnects_total", "reason" => "close_all")
            .increment(removed.len() as u64);
        tracing::debug!(endpoint = %endpoint, count = removed.len(), reason = %reason, "closed relay connections");
        self.health.on_disconnect(endpoint, reason, true);
    }

    /// Close every connection in the pool (shutdown path).
    pub fn shutdown(&self) {
        let endpoints: Vec<RelayUrl> = {
            let inner = self.inner.lock();
            inner.connections.keys().cloned().collect()
        };
        for endpoint in endpoints {
            self.close_all(&endpoint, "pool shutdown");
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let mut stats = PoolStats::default();
        for (endpoint, records) in &inner.connections {
            stats.total += records.len();
            stats
                .per_relay
                .insert(endpoint.clone(), records.len());
            for conn in records {
                if conn.is_idle() {
                    stats.idle += 1;
                } else {
                    stats.active += 1;
                }
            }
        }
        stats
    }

    /// Open-connection count for one relay (used by load-balancing selection).
    pub fn connection_count(&self, endpoint: &RelayUrl) -> usize {
        let inner = self.inner.lock();
        inner.connections.get(endpoint).map(Vec::len).unwrap_or(0)
    }

    /// Spawn the idle sweep. Runs until aborted.
    pub fn spawn_idle_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.idle_cleanup_interval;
        let pool = Arc::downgrade(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                pool.sweep_idle();
            }
        })
    }

    /// Retire connections idle longer than `max_idle`.
    fn sweep_idle(&self) {
        let max_idle = self.config.max_idle;
        let stale: Vec<Arc<RelayConnection>> = {
            let mut inner = self.inner.lock();
            let mut stale = Vec::new();
            for records in inner.connections.values_mut() {
                records.retain(|conn| {
                    if conn.is_idle() && conn.idle_for() > max_idle {
                        stale.push(Arc::clone(conn));
                        false
                    } else {
                        true
                    }
                });
            }
            inner.connections.retain(|_, records| !records.is_empty());
            inner.total = inner.total.saturating_sub(stale.len());
            stale
        };

        for conn in &stale {
            conn.signal_close();
            self.health
                .on_disconnect(conn.endpoint(), "idle sweep", true);
        }
        if !stale.is_empty() {
            counter!("relay_pool_disconnects_total", "reason" => "idle").increment(stale.len() as u64);
            tracing::debug!(count = stale.len(), "idle sweep closed connections");
        }
        gauge!("relay_pool_connections").set(self.stats().total as f64);
    }

    /// Reusable = open, healthy per the monitor's last verdict, and either
    /// idle (FIFO by creation; the record list is push-ordered) or the least
    /// loaded record below the per-connection subscription cap.
    fn pick_reusable(&self, inner: &PoolInner, endpoint: &RelayUrl) -> Option<Arc<RelayConnection>> {
        let records = inner.connections.get(endpoint)?;
        let healthy_now = self.health.is_healthy(endpoint);

        let usable: Vec<&Arc<RelayConnection>> = records
            .iter()
            .filter(|conn| {
                conn.set_healthy(healthy_now);
                !conn.is_closed() && healthy_now
            })
            .collect();

        if let Some(conn) = usable.iter().find(|conn| conn.is_idle()) {
            return Some(Arc::clone(conn));
        }

        usable
            .into_iter()
            .filter(|conn| conn.open_subscriptions() < self.config.max_subscriptions_per_connection)
            .min_by_key(|conn| conn.open_subscriptions())
            .map(Arc::clone)
    }

    /// Look up a connection created by another caller's dial and lease it.
    fn lease_by_id(&self, endpoint: &RelayUrl, id: ConnectionId) -> Option<Arc<RelayConnection>> {
        let inner = self.inner.lock();
        let conn = inner
            .connections
            .get(endpoint)?
            .iter()
            .find(|c| c.id() == id && !c.is_closed())?;
        conn.lease();
        Some(Arc::clone(conn))
    }

    /// The dial task: establish the socket, register the record, and publish
    /// the result to every caller waiting on this endpoint. Runs detached so
    /// a cancelled `acquire` never strands the pending-dial entry.
    async fn run_dial(self: Arc<Self>, endpoint: RelayUrl, tx: broadcast::Sender<DialResult>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let result = connection::establish(
            id,
            endpoint.clone(),
            self.config.connection_timeout,
            self.closed_tx.clone(),
        )
        .await;

        match result {
            Ok((conn, latency)) => {
                {
                    let mut inner = self.inner.lock();
                    inner.pending_dials.remove(&endpoint);
                    inner
                        .connections
                        .entry(endpoint.clone())
                        .or_default()
                        .push(Arc::clone(&conn));
                    inner.total += 1;
                }
                self.health.on_connect(&endpoint);
                self.health.on_success(&endpoint, latency);
                counter!("relay_pool_connects_total").increment(1);
                tracing::debug!(endpoint = %endpoint, latency_ms = latency.as_millis() as u64, "relay connected");
                let _ = tx.send(Ok(conn.id()));
            }
            Err(dial_err) => {
                {
                    let mut inner = self.inner.lock();
                    inner.pending_dials.remove(&endpoint);
                }
                self.health.on_failure(&endpoint, &dial_err.describe());
                counter!("relay_pool_connect_failures_total").increment(1);
                tracing::debug!(endpoint = %endpoint, reason = %dial_err.describe(), "relay dial failed");
                let _ = tx.send(Err(dial_err));
            }
        }
    }

    /// Socket-retirement task: removes records whose socket task ended on its
    /// own (remote close, transport error) and reports the disconnect.
    fn spawn_reaper(pool: Weak<Self>, mut closed_rx: mpsc::UnboundedReceiver<SocketClosed>) {
        tokio::spawn(async move {
            while let Some(closed) = closed_rx.recv().await {
                let Some(pool) = pool.upgrade() else { break };
                pool.handle_socket_closed(closed);
            }
        });
    }

    fn handle_socket_closed(&self, closed: SocketClosed) {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.connections.get_mut(&closed.endpoint) {
                Some(records) => {
                    let before = records.len();
                    records.retain(|c| c.id() != closed.id);
                    let removed = before - records.len();
                    if records.is_empty() {
                        inner.connections.remove(&closed.endpoint);
                    }
                    inner.total = inner.total.saturating_sub(removed);
                    removed > 0
                }
                None => false,
            }
        };

        // close_all and the idle sweep already removed and reported their
        // records; only report closes the pool has not seen yet.
        if removed {
            counter!("relay_pool_disconnects_total", "reason" => "socket").increment(1);
            self.health
                .on_disconnect(&closed.endpoint, &closed.reason, closed.initiated_locally);
        }
    }

    /// Insert a ready-made record (tests only).
    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, conn: Arc<RelayConnection>) {
        let mut inner = self.inner.lock();
        inner
            .connections
            .entry(conn.endpoint().clone())
            .or_default()
            .push(conn);
        inner.total += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthConfig;

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    fn pool_with(config: PoolConfig) -> Arc<ConnectionPool> {
        let health = Arc::new(HealthMonitor::new(HealthConfig::default()));
        ConnectionPool::new(config, health)
    }

    #[tokio::test]
    async fn test_acquire_reuses_existing_connection() {
        let pool = pool_with(PoolConfig::default());
        let endpoint = url("wss://relay.example.com");
        pool.insert_for_test(RelayConnection::stub(7, endpoint.clone()));

        // Repeated acquires against a live idle record never dial.
        let first = pool.acquire(&endpoint).await.unwrap();
        let second = pool.acquire(&endpoint).await.unwrap();
        assert_eq!(first.id(), 7);
        assert_eq!(second.id(), 7);
        assert_eq!(first.open_subscriptions(), 2);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn test_release_returns_connection_to_idle() {
        let pool = pool_with(PoolConfig::default());
        let endpoint = url("wss://relay.example.com");
        pool.insert_for_test(RelayConnection::stub(1, endpoint.clone()));

        let conn = pool.acquire(&endpoint).await.unwrap();
        assert_eq!(pool.stats().active, 1);

        pool.release(&endpoint, &conn);
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_per_relay_cap_enforced() {
        let pool = pool_with(PoolConfig {
            max_connections_per_relay: 1,
            max_subscriptions_per_connection: 1,
            ..Default::default()
        });
        let endpoint = url("wss://relay.example.com");
        let conn = RelayConnection::stub(1, endpoint.clone());
        conn.lease(); // saturate the single record
        pool.insert_for_test(conn);

        let err = pool.acquire(&endpoint).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
    }

    #[tokio::test]
    async fn test_global_cap_enforced() {
        let pool = pool_with(PoolConfig {
            max_total_connections: 1,
            ..Default::default()
        });
        let occupied = url("wss://relay-a.example.com");
        let other = url("wss://relay-b.example.com");
        pool.insert_for_test(RelayConnection::stub(1, occupied));

        let err = pool.acquire(&other).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
    }

    #[tokio::test]
    async fn test_close_all_is_idempotent() {
        let pool = pool_with(PoolConfig::default());
        let endpoint = url("wss://relay.example.com");
        let conn = RelayConnection::stub(1, endpoint.clone());
        pool.insert_for_test(Arc::clone(&conn));

        pool.close_all(&endpoint, "test");
        assert!(conn.is_closed());
        assert_eq!(pool.stats().total, 0);

        // Second close of the same endpoint is a no-op.
        pool.close_all(&endpoint, "test");
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_records_are_not_reused() {
        let health = Arc::new(HealthMonitor::new(HealthConfig {
            min_samples: 1,
            ..Default::default()
        }));
        let pool = ConnectionPool::new(
            PoolConfig {
                max_connections_per_relay: 1,
                ..Default::default()
            },
            Arc::clone(&health),
        );
        let endpoint = url("wss://relay.example.com");
        pool.insert_for_test(RelayConnection::stub(1, endpoint.clone()));

        health.on_failure(&endpoint, "refused");
        assert!(!health.is_healthy(&endpoint));

        // The only record mirrors the unhealthy verdict, and opening a second
        // would break the per-relay cap.
        let err = pool.acquire(&endpoint).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
    }

    #[tokio::test]
    async fn test_dial_failure_reports_health() {
        let health = Arc::new(HealthMonitor::default());
        let pool = ConnectionPool::new(
            PoolConfig {
                connection_timeout: Duration::from_millis(250),
                ..Default::default()
            },
            Arc::clone(&health),
        );
        // TEST-NET-1: unroutable, dial fails or times out.
        let endpoint = url("ws://192.0.2.1:8080");

        let err = pool.acquire(&endpoint).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectionTimeout { .. } | Error::ConnectionFailed { .. }
        ));

        let metrics = health.metrics(&endpoint).unwrap();
        assert_eq!(metrics.samples, 1);
        assert!(metrics.last_failure.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_one_dial() {
        let health = Arc::new(HealthMonitor::default());
        let pool = ConnectionPool::new(
            PoolConfig {
                connection_timeout: Duration::from_millis(250),
                ..Default::default()
            },
            Arc::clone(&health),
        );
        let endpoint = url("ws://192.0.2.1:8080");

        let (a, b) = tokio::join!(pool.acquire(&endpoint), pool.acquire(&endpoint));
        assert!(a.is_err());
        assert!(b.is_err());

        // Exactly one dial happened: the joiner shares the dialer's outcome
        // instead of recording a second failure sample.
        let metrics = health.metrics(&endpoint).unwrap();
        assert_eq!(metrics.samples, 1);
    }
}
