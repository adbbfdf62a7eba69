//! Relay health tracking.
//!
//! The `HealthMonitor` passively records the outcome of every connection and
//! request attempt per relay, and derives a composite health score from
//! latency, success rate and connection stability. Other components read
//! snapshots; the monitor never closes a connection itself.
//!
//! An endpoint's `healthy` flag only flips once `min_samples` observations
//! have accumulated, so a single slow first request cannot disqualify a
//! relay. Endpoints without enough samples are assumed healthy with a
//! neutral score.

pub mod probe;
mod score;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use nostr::RelayUrl;
use parking_lot::Mutex;

pub use probe::{spawn_prober, ProbeConfig};
pub use score::{composite_score, ScoreInputs, DEFAULT_SCORE};
use score::{STABILITY_CONNECT_BONUS, STABILITY_DISCONNECT_PENALTY};

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Number of samples kept in the rolling latency/outcome windows.
    pub window_size: usize,
    /// Minimum observations before the `healthy` flag may change.
    pub min_samples: u64,
    /// Windowed success rate at or above which an endpoint is healthy.
    pub healthy_success_rate: f64,
    /// Latency budget used to normalize the latency score (milliseconds).
    pub max_latency_ms: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            min_samples: 5,
            healthy_success_rate: 0.85,
            max_latency_ms: 3000.0,
        }
    }
}

/// Snapshot of one endpoint's health state.
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Rolling average latency in milliseconds.
    pub avg_latency_ms: Option<f64>,
    /// Success rate over the outcome window (0.0 - 1.0).
    pub success_rate: Option<f64>,
    /// Connection stability (0.0 - 1.0).
    pub stability: f64,
    /// Composite health score (0.0 - 1.0).
    pub score: f64,
    /// Total observations recorded for this endpoint.
    pub samples: u64,
    /// Current healthy verdict.
    pub healthy: bool,
    /// Time of the most recent successful observation.
    pub last_success: Option<Instant>,
    /// Time of the most recent failed observation.
    pub last_failure: Option<Instant>,
}

/// A healthy/unhealthy transition, delivered to registered handlers.
#[derive(Debug, Clone)]
pub enum HealthTransition {
    /// Endpoint crossed from healthy to unhealthy.
    Degraded { endpoint: RelayUrl },
    /// Endpoint crossed from unhealthy back to healthy.
    Recovered { endpoint: RelayUrl },
}

/// Handle returned by [`HealthMonitor::register_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

type TransitionHandler = Arc<dyn Fn(&HealthTransition) + Send + Sync>;

/// Per-endpoint rolling state.
struct EndpointHealth {
    latencies: VecDeque<f64>,
    outcomes: VecDeque<bool>,
    stability: f64,
    samples: u64,
    healthy: bool,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
}

impl EndpointHealth {
    fn new() -> Self {
        Self {
            latencies: VecDeque::new(),
            outcomes: VecDeque::new(),
            stability: 0.5,
            samples: 0,
            healthy: true,
            last_success: None,
            last_failure: None,
        }
    }

    fn push_outcome(&mut self, success: bool, window: usize) {
        self.outcomes.push_back(success);
        while self.outcomes.len() > window {
            self.outcomes.pop_front();
        }
        self.samples += 1;
    }

    fn push_latency(&mut self, latency_ms: f64, window: usize) {
        self.latencies.push_back(latency_ms);
        while self.latencies.len() > window {
            self.latencies.pop_front();
        }
    }

    fn avg_latency_ms(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            return None;
        }
        Some(self.latencies.iter().sum::<f64>() / self.latencies.len() as f64)
    }

    fn success_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let successes = self.outcomes.iter().filter(|s| **s).count();
        Some(successes as f64 / self.outcomes.len() as f64)
    }

    fn score_inputs(&self) -> ScoreInputs {
        ScoreInputs {
            avg_latency_ms: self.avg_latency_ms(),
            success_rate: self.success_rate(),
            stability: self.stability,
        }
    }
}

struct MonitorInner {
    endpoints: HashMap<RelayUrl, EndpointHealth>,
    handlers: Vec<(u64, TransitionHandler)>,
    next_handler_id: u64,
}

/// Tracks per-relay health and emits degraded/recovered transitions.
///
/// Thread-safe; all methods take `&self`.
pub struct HealthMonitor {
    config: HealthConfig,
    inner: Mutex<MonitorInner>,
}

impl HealthMonitor {
    /// Create a monitor with the given configuration.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(MonitorInner {
                endpoints: HashMap::new(),
                handlers: Vec::new(),
                next_handler_id: 0,
            }),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record a successful request/probe with its observed latency.
    pub fn on_success(&self, endpoint: &RelayUrl, latency: Duration) {
        let mut inner = self.inner.lock();
        let window = self.config.window_size;
        let state = inner
            .endpoints
            .entry(endpoint.clone())
            .or_insert_with(EndpointHealth::new);

        state.push_outcome(true, window);
        state.push_latency(latency.as_secs_f64() * 1000.0, window);
        state.last_success = Some(Instant::now());

        let pending = self.reassess(&mut inner, endpoint);
        drop(inner);
        self.dispatch(pending);
    }

    /// Record a failed request/probe.
    pub fn on_failure(&self, endpoint: &RelayUrl, reason: &str) {
        let mut inner = self.inner.lock();
        let window = self.config.window_size;
        let state = inner
            .endpoints
            .entry(endpoint.clone())
            .or_insert_with(EndpointHealth::new);

        state.push_outcome(false, window);
        state.last_failure = Some(Instant::now());
        tracing::debug!(endpoint = %endpoint, reason = %reason, "relay failure recorded");

        let pending = self.reassess(&mut inner, endpoint);
        drop(inner);
        self.dispatch(pending);
    }

    /// Record a clean connection establishment (stability bonus).
    pub fn on_connect(&self, endpoint: &RelayUrl) {
        let mut inner = self.inner.lock();
        let state = inner
            .endpoints
            .entry(endpoint.clone())
            .or_insert_with(EndpointHealth::new);
        state.stability = (state.stability + STABILITY_CONNECT_BONUS).min(1.0);
    }

    /// Record a disconnect. `expected` is true for closes this client asked
    /// for (release, idle sweep, shutdown); only unexpected closes are
    /// penalized as instability.
    pub fn on_disconnect(&self, endpoint: &RelayUrl, reason: &str, expected: bool) {
        let mut inner = self.inner.lock();
        let state = inner
            .endpoints
            .entry(endpoint.clone())
            .or_insert_with(EndpointHealth::new);

        if !expected {
            state.stability = (state.stability - STABILITY_DISCONNECT_PENALTY).max(0.0);
            tracing::debug!(endpoint = %endpoint, reason = %reason, "unexpected disconnect");
        }

        let pending = self.reassess(&mut inner, endpoint);
        drop(inner);
        self.dispatch(pending);
    }

    /// Snapshot of one endpoint's health, if any observations exist.
    pub fn metrics(&self, endpoint: &RelayUrl) -> Option<HealthMetrics> {
        let inner = self.inner.lock();
        let state = inner.endpoints.get(endpoint)?;
        Some(HealthMetrics {
            avg_latency_ms: state.avg_latency_ms(),
            success_rate: state.success_rate(),
            stability: state.stability,
            score: composite_score(&state.score_inputs(), self.config.max_latency_ms),
            samples: state.samples,
            healthy: state.healthy,
            last_success: state.last_success,
            last_failure: state.last_failure,
        })
    }

    /// Composite score for ranking.
    ///
    /// Endpoints that are unknown or below `min_samples` report the neutral
    /// [`DEFAULT_SCORE`]: assumed healthy until proven otherwise.
    pub fn score(&self, endpoint: &RelayUrl) -> f64 {
        let inner = self.inner.lock();
        match inner.endpoints.get(endpoint) {
            Some(state) if state.samples >= self.config.min_samples => {
                composite_score(&state.score_inputs(), self.config.max_latency_ms)
            }
            _ => DEFAULT_SCORE,
        }
    }

    /// Current healthy verdict; unknown endpoints are assumed healthy.
    pub fn is_healthy(&self, endpoint: &RelayUrl) -> bool {
        let inner = self.inner.lock();
        inner
            .endpoints
            .get(endpoint)
            .map(|s| s.healthy)
            .unwrap_or(true)
    }

    /// All currently-healthy endpoints with their scores, best first.
    pub fn healthy_endpoints(&self) -> Vec<(RelayUrl, f64)> {
        let inner = self.inner.lock();
        let mut out: Vec<(RelayUrl, f64)> = inner
            .endpoints
            .iter()
            .filter(|(_, s)| s.healthy)
            .map(|(url, s)| {
                let score = if s.samples >= self.config.min_samples {
                    composite_score(&s.score_inputs(), self.config.max_latency_ms)
                } else {
                    DEFAULT_SCORE
                };
                (url.clone(), score)
            })
            .collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// Register a transition handler. Handlers are invoked inline after the
    /// monitor's lock is released and must not block.
    pub fn register_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&HealthTransition) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_handler_id;
        inner.next_handler_id += 1;
        inner.handlers.push((id, Arc::new(handler)));
        HandlerId(id)
    }

    /// Remove a previously registered handler. Unknown ids are a no-op.
    pub fn unregister_handler(&self, id: HandlerId) {
        let mut inner = self.inner.lock();
        inner.handlers.retain(|(hid, _)| *hid != id.0);
    }

    /// Re-derive the healthy flag; returns the transition to dispatch, if any,
    /// along with the handlers to call.
    fn reassess(
        &self,
        inner: &mut MonitorInner,
        endpoint: &RelayUrl,
    ) -> Option<(HealthTransition, Vec<TransitionHandler>)> {
        let state = inner.endpoints.get_mut(endpoint)?;
        if state.samples < self.config.min_samples {
            return None;
        }

        let rate = state.success_rate()?;
        let now_healthy = rate >= self.config.healthy_success_rate;
        if now_healthy == state.healthy {
            return None;
        }
        state.healthy = now_healthy;

        let transition = if now_healthy {
            counter!("relay_health_transitions_total", "state" => "recovered").increment(1);
            tracing::info!(endpoint = %endpoint, success_rate = rate, "relay recovered");
            HealthTransition::Recovered {
                endpoint: endpoint.clone(),
            }
        } else {
            counter!("relay_health_transitions_total", "state" => "degraded").increment(1);
            tracing::warn!(endpoint = %endpoint, success_rate = rate, "relay degraded");
            HealthTransition::Degraded {
                endpoint: endpoint.clone(),
            }
        };

        let handlers = inner.handlers.iter().map(|(_, h)| Arc::clone(h)).collect();
        Some((transition, handlers))
    }

    fn dispatch(&self, pending: Option<(HealthTransition, Vec<TransitionHandler>)>) {
        if let Some((transition, handlers)) = pending {
            for handler in handlers {
                handler(&transition);
            }
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
