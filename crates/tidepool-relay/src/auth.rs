//! NIP-42 authentication-challenge bookkeeping.
//!
//! Some relays demand authentication before serving requests. This component
//! tracks the per-relay challenge/response state machine and retry budget,
//! and produces the signed response event through the injected signer. It
//! never performs network I/O and never sees key material: sending the AUTH
//! message is the subscribing caller's job.
//!
//! State machine per endpoint:
//! `Unknown → ChallengeReceived → Authenticating → Authenticated | Failed`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nostr::{Event, EventBuilder, NostrSigner, RelayUrl};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{Error, Result};

/// Configuration for the auth challenge manager.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Auth attempts per endpoint before it is excluded for the session.
    pub max_retries: u32,
    /// Challenges older than this are purged by the sweep.
    pub challenge_ttl: Duration,
    /// How often the sweep runs.
    pub sweep_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            challenge_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Authentication state for one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Unknown,
    ChallengeReceived,
    Authenticating,
    Authenticated,
    Failed,
}

#[derive(Debug)]
struct AuthState {
    status: AuthStatus,
    challenge: Option<String>,
    challenge_at: Option<Instant>,
    attempts: u32,
}

impl AuthState {
    fn new() -> Self {
        Self {
            status: AuthStatus::Unknown,
            challenge: None,
            challenge_at: None,
            attempts: 0,
        }
    }
}

/// Tracks per-relay authentication state and builds NIP-42 responses.
pub struct AuthChallengeManager {
    config: AuthConfig,
    inner: Mutex<HashMap<RelayUrl, AuthState>>,
}

impl AuthChallengeManager {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record a challenge received from a relay.
    pub fn record_challenge(&self, endpoint: &RelayUrl, challenge: &str) {
        let mut inner = self.inner.lock();
        let state = inner
            .entry(endpoint.clone())
            .or_insert_with(AuthState::new);
        state.challenge = Some(challenge.to_string());
        state.challenge_at = Some(Instant::now());
        state.status = AuthStatus::ChallengeReceived;
        tracing::debug!(endpoint = %endpoint, "auth challenge recorded");
    }

    /// The outstanding, unexpired challenge for an endpoint.
    pub fn challenge(&self, endpoint: &RelayUrl) -> Option<String> {
        let inner = self.inner.lock();
        let state = inner.get(endpoint)?;
        let age = state.challenge_at?.elapsed();
        if age > self.config.challenge_ttl {
            return None;
        }
        state.challenge.clone()
    }

    /// Build the signed NIP-42 response (kind 22242) for a challenge.
    ///
    /// Marks the endpoint `Authenticating`. Fails with `AuthRetryExhausted`
    /// once the retry budget is spent.
    pub async fn build_auth_response<S>(
        &self,
        challenge: &str,
        endpoint: &RelayUrl,
        signer: &S,
    ) -> Result<Event>
    where
        S: NostrSigner,
    {
        {
            let mut inner = self.inner.lock();
            let state = inner
                .entry(endpoint.clone())
                .or_insert_with(AuthState::new);
            if state.attempts >= self.config.max_retries {
                return Err(Error::AuthRetryExhausted {
                    endpoint: endpoint.clone(),
                    attempts: state.attempts,
                });
            }
            state.status = AuthStatus::Authenticating;
        }

        EventBuilder::auth(challenge, endpoint.clone())
            .sign(signer)
            .await
            .map_err(|e| Error::Signer(e.to_string()))
    }

    /// Mark an endpoint as authenticated. Resets the retry budget.
    pub fn mark_authenticated(&self, endpoint: &RelayUrl) {
        let mut inner = self.inner.lock();
        let state = inner
            .entry(endpoint.clone())
            .or_insert_with(AuthState::new);
        state.status = AuthStatus::Authenticated;
        state.challenge = None;
        state.challenge_at = None;
        state.attempts = 0;
        tracing::debug!(endpoint = %endpoint, "relay authenticated");
    }

    /// Record that the relay demanded (or re-demanded) authentication.
    /// Increments the attempt counter; past the budget the endpoint is
    /// marked `Failed` for the session.
    pub fn mark_auth_required(&self, endpoint: &RelayUrl) {
        let mut inner = self.inner.lock();
        let state = inner
            .entry(endpoint.clone())
            .or_insert_with(AuthState::new);
        state.attempts += 1;
        if state.attempts >= self.config.max_retries {
            state.status = AuthStatus::Failed;
            tracing::warn!(
                endpoint = %endpoint,
                attempts = state.attempts,
                "auth retry budget exhausted"
            );
        }
    }

    /// Whether another auth attempt is allowed for this endpoint.
    pub fn can_retry(&self, endpoint: &RelayUrl) -> bool {
        let inner = self.inner.lock();
        inner
            .get(endpoint)
            .map(|s| s.attempts < self.config.max_retries)
            .unwrap_or(true)
    }

    /// Current state for an endpoint.
    pub fn status(&self, endpoint: &RelayUrl) -> AuthStatus {
        let inner = self.inner.lock();
        inner
            .get(endpoint)
            .map(|s| s.status)
            .unwrap_or(AuthStatus::Unknown)
    }

    /// True once the endpoint has authenticated this session.
    pub fn is_authenticated(&self, endpoint: &RelayUrl) -> bool {
        self.status(endpoint) == AuthStatus::Authenticated
    }

    /// Forget everything about an endpoint.
    pub fn clear(&self, endpoint: &RelayUrl) {
        self.inner.lock().remove(endpoint);
    }

    /// Purge challenges older than the TTL. Attempt counters survive: the
    /// retry budget is per session, not per challenge.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock();
        let ttl = self.config.challenge_ttl;
        let mut purged = 0usize;
        for state in inner.values_mut() {
            let expired = state
                .challenge_at
                .is_some_and(|at| at.elapsed() > ttl);
            if expired {
                state.challenge = None;
                state.challenge_at = None;
                if state.status == AuthStatus::ChallengeReceived {
                    state.status = AuthStatus::Unknown;
                }
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::debug!(purged, "purged stale auth challenges");
        }
    }

    /// Spawn the periodic challenge sweep. Runs until aborted.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.sweep_interval;
        let manager = Arc::downgrade(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                manager.sweep();
            }
        })
    }

    #[cfg(test)]
    fn attempts(&self, endpoint: &RelayUrl) -> u32 {
        self.inner
            .lock()
            .get(endpoint)
            .map(|s| s.attempts)
            .unwrap_or(0)
    }
}

impl Default for AuthChallengeManager {
    fn default() -> Self {
        Self::new(AuthConfig::default())
    }
}
