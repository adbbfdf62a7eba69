//! Top-level wiring for the relay layer.
//!
//! `RelayContext` is the dependency-injected composition root: it owns the
//! pool, health monitor, distributor, selector and auth manager, plus the
//! background sweeps. There are no process-wide globals; construct one
//! context at application startup and hand it (by `Arc`) to every consumer.

use std::collections::HashSet;
use std::sync::Arc;

use nostr::{NostrSigner, PublicKey, RelayUrl};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::auth::{AuthChallengeManager, AuthConfig};
use crate::buffer::BufferConfig;
use crate::distributor::{DistributorConfig, RelayDistributor, SubscriptionPlan};
use crate::health::{spawn_prober, HealthConfig, HealthMonitor, ProbeConfig};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::relay_lists::PreferenceFetcher;
use crate::strategy::{QueryPurpose, SelectOptions, StrategySelector};
use crate::subscribe::{subscribe, SubscriptionHandle, SubscriptionHandlers};
use crate::Result;

/// Aggregated configuration for one relay-layer context.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub pool: PoolConfig,
    pub health: HealthConfig,
    pub probe: ProbeConfig,
    pub distributor: DistributorConfig,
    pub auth: AuthConfig,
}

/// The relay layer's composition root.
pub struct RelayContext {
    health: Arc<HealthMonitor>,
    pool: Arc<ConnectionPool>,
    distributor: RelayDistributor,
    selector: StrategySelector,
    auth: Arc<AuthChallengeManager>,
    signer: Mutex<Option<Arc<dyn NostrSigner>>>,
    /// Relays referenced by recent plans; the active prober assesses these
    /// even while no connection to them is open.
    relevant: Arc<Mutex<HashSet<RelayUrl>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayContext {
    /// Build the context and spawn its background tasks (pool idle sweep,
    /// health probe sweep, auth challenge sweep). Requires a tokio runtime.
    pub fn new(settings: Settings) -> Arc<Self> {
        let health = Arc::new(HealthMonitor::new(settings.health));
        let pool = ConnectionPool::new(settings.pool, Arc::clone(&health));
        let distributor = RelayDistributor::new(settings.distributor);
        let selector = StrategySelector::new(Arc::clone(&health), Arc::clone(&pool));
        let auth = Arc::new(AuthChallengeManager::new(settings.auth));
        let relevant: Arc<Mutex<HashSet<RelayUrl>>> = Arc::new(Mutex::new(HashSet::new()));

        let mut tasks = Vec::new();
        tasks.push(Arc::clone(&pool).spawn_idle_sweeper());
        tasks.push(Arc::clone(&auth).spawn_sweeper());
        let probe_targets = {
            let relevant = Arc::clone(&relevant);
            Arc::new(move || relevant.lock().iter().cloned().collect::<Vec<_>>())
        };
        tasks.push(spawn_prober(
            Arc::clone(&health),
            settings.probe,
            probe_targets,
        ));

        Arc::new(Self {
            health,
            pool,
            distributor,
            selector,
            auth,
            signer: Mutex::new(None),
            relevant,
            tasks: Mutex::new(tasks),
        })
    }

    /// Install the signer used to answer NIP-42 challenges. Without one,
    /// auth-demanding relays are dropped from subscriptions.
    pub fn set_signer(&self, signer: Arc<dyn NostrSigner>) {
        *self.signer.lock() = Some(signer);
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn auth(&self) -> &Arc<AuthChallengeManager> {
        &self.auth
    }

    pub fn selector(&self) -> &StrategySelector {
        &self.selector
    }

    pub fn distributor(&self) -> &RelayDistributor {
        &self.distributor
    }

    /// Relays referenced by recent plans (the active prober's target set).
    pub fn relevant_relays(&self) -> Vec<RelayUrl> {
        self.relevant.lock().iter().cloned().collect()
    }

    /// Compute a subscription plan and remember its relays as
    /// probe-relevant.
    pub async fn plan(
        &self,
        authors: &[PublicKey],
        self_author: Option<&PublicKey>,
        fetcher: &dyn PreferenceFetcher,
    ) -> Result<SubscriptionPlan> {
        let plan = self.distributor.plan(authors, self_author, fetcher).await?;
        {
            let mut relevant = self.relevant.lock();
            for relay in plan.relays() {
                relevant.insert(relay.clone());
            }
        }
        Ok(plan)
    }

    /// Select relays for a query purpose from an available set.
    pub fn select(
        &self,
        available: &[RelayUrl],
        purpose: QueryPurpose,
        opts: &SelectOptions,
    ) -> Vec<RelayUrl> {
        self.selector.select(available, purpose, opts)
    }

    /// Subscribe to a plan with purpose-tuned buffering.
    pub async fn subscribe(
        &self,
        plan: SubscriptionPlan,
        purpose: QueryPurpose,
        handlers: SubscriptionHandlers,
    ) -> Result<SubscriptionHandle> {
        let signer = self.signer.lock().clone();
        subscribe(
            Arc::clone(&self.pool),
            Arc::clone(&self.auth),
            plan,
            BufferConfig::for_purpose(purpose),
            signer,
            handlers,
        )
        .await
    }

    /// Stop background tasks and close every connection. Idempotent.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pool.shutdown();
    }
}

impl Drop for RelayContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
