//! Query-purpose-aware relay selection.
//!
//! Given the relays a plan (or the health monitor) makes available, pick the
//! concrete subset to use for one query. Strategies are pluggable and chosen
//! by name; a safe fallback chain guarantees that a non-empty input never
//! selects into an empty output: when the health filter would reject every
//! relay, the threshold relaxes instead.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nostr::RelayUrl;
use parking_lot::RwLock;

use crate::health::HealthMonitor;
use crate::pool::ConnectionPool;

/// What a query is for. Closed set; influences ranking weights and
/// specialized-relay boosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryPurpose {
    Profile,
    Events,
    Reactions,
    Broadcast,
    Search,
    Realtime,
}

impl QueryPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Events => "events",
            Self::Reactions => "reactions",
            Self::Broadcast => "broadcast",
            Self::Search => "search",
            Self::Realtime => "realtime",
        }
    }

    /// Purposes where the user is actively waiting on first paint.
    fn latency_sensitive(&self) -> bool {
        matches!(self, Self::Profile | Self::Realtime)
    }
}

impl std::str::FromStr for QueryPurpose {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "profile" => Ok(Self::Profile),
            "events" => Ok(Self::Events),
            "reactions" => Ok(Self::Reactions),
            "broadcast" => Ok(Self::Broadcast),
            "search" => Ok(Self::Search),
            "realtime" => Ok(Self::Realtime),
            other => Err(format!("unknown query purpose '{}'", other)),
        }
    }
}

/// Selection constraints supplied by the caller.
#[derive(Debug, Clone)]
pub struct SelectOptions {
    /// How many relays the query wants.
    pub count: usize,
    /// Minimum health score; relaxed rather than returning nothing.
    pub min_health_score: f64,
    /// Relays to never return (e.g. auth-exhausted this session).
    pub exclude: HashSet<RelayUrl>,
    /// Preferred region tag, used by the specialized strategy.
    pub region: Option<String>,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            count: 3,
            min_health_score: 0.0,
            exclude: HashSet::new(),
            region: None,
        }
    }
}

/// Read-only view of the services a strategy may consult.
pub struct StrategyContext<'a> {
    pub health: &'a HealthMonitor,
    pub pool: &'a ConnectionPool,
}

/// A relay selection strategy.
///
/// Strategies read snapshots and must not block. Returning an empty vec
/// hands the decision to the fallback chain.
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(
        &self,
        cx: &StrategyContext<'_>,
        available: &[RelayUrl],
        purpose: QueryPurpose,
        opts: &SelectOptions,
    ) -> Vec<RelayUrl>;
}

/// Number of lower-scoring backup relays appended beyond the requested count.
const BACKUP_RELAYS: usize = 2;

/// Rank by composite health score, weighting latency more heavily for
/// latency-sensitive purposes, and append up to two lower-scoring backups.
pub struct HealthAwareStrategy;

impl HealthAwareStrategy {
    fn effective_score(cx: &StrategyContext<'_>, relay: &RelayUrl, purpose: QueryPurpose) -> f64 {
        let base = cx.health.score(relay);
        if !purpose.latency_sensitive() {
            return base;
        }
        // Extra latency emphasis: up to +0.25 for a fast relay, nothing for
        // one at or beyond the latency budget.
        let latency_bonus = cx
            .health
            .metrics(relay)
            .and_then(|m| m.avg_latency_ms)
            .map(|avg| (1.0 - avg / cx.health.config().max_latency_ms).max(0.0) * 0.25)
            .unwrap_or(0.0);
        base + latency_bonus
    }
}

impl SelectionStrategy for HealthAwareStrategy {
    fn name(&self) -> &'static str {
        "health-aware"
    }

    fn select(
        &self,
        cx: &StrategyContext<'_>,
        available: &[RelayUrl],
        purpose: QueryPurpose,
        opts: &SelectOptions,
    ) -> Vec<RelayUrl> {
        let mut ranked: Vec<(RelayUrl, f64, f64)> = available
            .iter()
            .filter(|r| !opts.exclude.contains(r))
            .map(|r| {
                (
                    r.clone(),
                    cx.health.score(r),
                    Self::effective_score(cx, r, purpose),
                )
            })
            .collect();
        ranked.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let passing: Vec<&(RelayUrl, f64, f64)> = ranked
            .iter()
            .filter(|(_, base, _)| *base >= opts.min_health_score)
            .collect();

        // Relax the threshold rather than starving the query.
        let pool: Vec<RelayUrl> = if passing.is_empty() {
            ranked.iter().map(|(r, _, _)| r.clone()).collect()
        } else {
            passing.into_iter().map(|(r, _, _)| r.clone()).collect()
        };

        pool.into_iter().take(opts.count + BACKUP_RELAYS).collect()
    }
}

/// Rank by current open-connection count ascending, tie-broken by health.
pub struct LoadBalancingStrategy;

impl SelectionStrategy for LoadBalancingStrategy {
    fn name(&self) -> &'static str {
        "load-balancing"
    }

    fn select(
        &self,
        cx: &StrategyContext<'_>,
        available: &[RelayUrl],
        _purpose: QueryPurpose,
        opts: &SelectOptions,
    ) -> Vec<RelayUrl> {
        let mut ranked: Vec<(RelayUrl, usize, f64)> = available
            .iter()
            .filter(|r| !opts.exclude.contains(r))
            .map(|r| (r.clone(), cx.pool.connection_count(r), cx.health.score(r)))
            .collect();

        ranked.sort_by(|a, b| {
            a.1.cmp(&b.1).then_with(|| {
                b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal)
            })
        });

        let passing: Vec<RelayUrl> = ranked
            .iter()
            .filter(|(_, _, score)| *score >= opts.min_health_score)
            .map(|(r, _, _)| r.clone())
            .collect();

        let pool = if passing.is_empty() {
            ranked.into_iter().map(|(r, _, _)| r).collect()
        } else {
            passing
        };

        pool.into_iter().take(opts.count).collect()
    }
}

/// Boost relays with a known strength for the purpose and/or a matching
/// region hint; otherwise behaves like health ranking.
#[derive(Default)]
pub struct SpecializedStrategy {
    strengths: HashMap<RelayUrl, HashSet<QueryPurpose>>,
    regions: HashMap<RelayUrl, String>,
}

impl SpecializedStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strength(mut self, relay: RelayUrl, purpose: QueryPurpose) -> Self {
        self.strengths.entry(relay).or_default().insert(purpose);
        self
    }

    pub fn with_region(mut self, relay: RelayUrl, region: impl Into<String>) -> Self {
        self.regions.insert(relay, region.into());
        self
    }
}

impl SelectionStrategy for SpecializedStrategy {
    fn name(&self) -> &'static str {
        "specialized"
    }

    fn select(
        &self,
        cx: &StrategyContext<'_>,
        available: &[RelayUrl],
        purpose: QueryPurpose,
        opts: &SelectOptions,
    ) -> Vec<RelayUrl> {
        let mut ranked: Vec<(RelayUrl, f64)> = available
            .iter()
            .filter(|r| !opts.exclude.contains(r))
            .map(|r| {
                let mut score = cx.health.score(r);
                if self
                    .strengths
                    .get(r)
                    .is_some_and(|purposes| purposes.contains(&purpose))
                {
                    score += 0.3;
                }
                if let Some(region) = &opts.region {
                    if self.regions.get(r) == Some(region) {
                        score += 0.2;
                    }
                }
                (r.clone(), score)
            })
            .collect();

        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
            .into_iter()
            .take(opts.count)
            .map(|(r, _)| r)
            .collect()
    }
}

/// Last resort: the first N available relays, exclusions honored.
pub struct FallbackStrategy;

impl SelectionStrategy for FallbackStrategy {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn select(
        &self,
        _cx: &StrategyContext<'_>,
        available: &[RelayUrl],
        _purpose: QueryPurpose,
        opts: &SelectOptions,
    ) -> Vec<RelayUrl> {
        available
            .iter()
            .filter(|r| !opts.exclude.contains(r))
            .take(opts.count)
            .cloned()
            .collect()
    }
}

/// Strategy registry plus the fallback chain.
pub struct StrategySelector {
    health: Arc<HealthMonitor>,
    pool: Arc<ConnectionPool>,
    strategies: RwLock<Vec<Arc<dyn SelectionStrategy>>>,
}

impl StrategySelector {
    /// Build a selector with the built-in strategies registered.
    pub fn new(health: Arc<HealthMonitor>, pool: Arc<ConnectionPool>) -> Self {
        let strategies: Vec<Arc<dyn SelectionStrategy>> = vec![
            Arc::new(HealthAwareStrategy),
            Arc::new(LoadBalancingStrategy),
            Arc::new(SpecializedStrategy::new()),
            Arc::new(FallbackStrategy),
        ];
        Self {
            health,
            pool,
            strategies: RwLock::new(strategies),
        }
    }

    /// Register (or replace) a strategy by name.
    pub fn register(&self, strategy: Arc<dyn SelectionStrategy>) {
        let mut strategies = self.strategies.write();
        strategies.retain(|s| s.name() != strategy.name());
        strategies.push(strategy);
    }

    /// Select with the default (health-aware) strategy.
    pub fn select(
        &self,
        available: &[RelayUrl],
        purpose: QueryPurpose,
        opts: &SelectOptions,
    ) -> Vec<RelayUrl> {
        self.select_with("health-aware", available, purpose, opts)
    }

    /// Select with a named strategy, falling back to the fallback strategy
    /// (and finally to first-N) when the choice yields nothing.
    pub fn select_with(
        &self,
        strategy_name: &str,
        available: &[RelayUrl],
        purpose: QueryPurpose,
        opts: &SelectOptions,
    ) -> Vec<RelayUrl> {
        if available.is_empty() {
            return Vec::new();
        }

        let cx = StrategyContext {
            health: &self.health,
            pool: &self.pool,
        };

        let chosen = {
            let strategies = self.strategies.read();
            strategies.iter().find(|s| s.name() == strategy_name).cloned()
        };

        let mut selected = match chosen {
            Some(strategy) => strategy.select(&cx, available, purpose, opts),
            None => {
                tracing::debug!(strategy = strategy_name, "unknown strategy, using fallback");
                Vec::new()
            }
        };

        if selected.is_empty() {
            selected = FallbackStrategy.select(&cx, available, purpose, opts);
        }

        // A non-empty input with nothing but excluded relays is the one case
        // allowed to come back empty: the caller excluded them deliberately.
        selected
    }
}
