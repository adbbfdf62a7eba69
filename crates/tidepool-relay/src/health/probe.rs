//! Active relay probing.
//!
//! Passive observation only covers relays the client is actively using. The
//! prober periodically runs a cheap connect-and-close against a
//! caller-supplied "currently relevant" endpoint list, so idle relays keep an
//! up-to-date score and can be picked again once they recover.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use nostr::RelayUrl;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;

use super::HealthMonitor;

/// Configuration for the active prober.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// How often to run a probe sweep.
    pub interval: Duration,
    /// Per-probe connect budget; shares the pool's dial timeout default.
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Provider of the endpoint list worth probing right now.
pub type ProbeTargets = Arc<dyn Fn() -> Vec<RelayUrl> + Send + Sync>;

/// Spawn the background probe sweep.
///
/// Results feed the same scoring pipeline as passive observations. The task
/// runs until aborted (see `RelayContext::shutdown`).
pub fn spawn_prober(
    monitor: Arc<HealthMonitor>,
    config: ProbeConfig,
    targets: ProbeTargets,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a freshly started
        // context does not probe before anything is relevant.
        interval.tick().await;

        loop {
            interval.tick().await;

            let endpoints = targets();
            if endpoints.is_empty() {
                continue;
            }
            tracing::debug!(count = endpoints.len(), "running relay probe sweep");

            let probes = endpoints.into_iter().map(|endpoint| {
                let monitor = Arc::clone(&monitor);
                let timeout = config.timeout;
                async move {
                    match probe_endpoint(&endpoint, timeout).await {
                        Ok(latency) => monitor.on_success(&endpoint, latency),
                        Err(reason) => monitor.on_failure(&endpoint, &reason),
                    }
                }
            });
            join_all(probes).await;
        }
    })
}

/// Connect-and-close liveness probe; returns the handshake latency.
pub async fn probe_endpoint(endpoint: &RelayUrl, timeout: Duration) -> Result<Duration, String> {
    let started = Instant::now();
    let url = endpoint.to_string();

    match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
        Ok(Ok((mut ws, _response))) => {
            let latency = started.elapsed();
            // Best-effort clean close; the measurement is already taken.
            let _ = ws.close(None).await;
            Ok(latency)
        }
        Ok(Err(e)) => Err(format!("probe connect failed: {}", e)),
        Err(_) => Err(format!("probe timed out after {:?}", timeout)),
    }
}
