//! Author-to-relay distribution.
//!
//! Given a set of target authors, compute which relays to subscribe where so
//! that every author is covered with bounded redundancy and total fan-out
//! stays small. The distributor is a pure computation over fetched
//! preference lists: it never opens connections and only performs network
//! I/O through the injected [`PreferenceFetcher`].

use std::collections::{HashMap, HashSet};

use metrics::{counter, gauge};
use nostr::{Filter, PublicKey, RelayUrl};

use crate::relay_lists::PreferenceFetcher;
use crate::{Error, Result};

/// Configuration for the distributor.
///
/// The reduction thresholds are tuned heuristics, not contracts; adjust them
/// rather than working around them.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// How many of an author's top preferred relays to consider.
    pub max_relays_per_author: usize,
    /// Reduction only applies when more candidate relays than this exist.
    pub reduction_candidate_threshold: usize,
    /// Redundancy floor preserved by the reduction pass.
    pub min_coverage: usize,
    /// Well-known, broadly available relays used when no preference data is
    /// available for an author.
    pub default_relays: Vec<RelayUrl>,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        let default_relays = [
            "wss://relay.damus.io",
            "wss://relay.nostr.band",
            "wss://nos.lol",
            "wss://relay.primal.net",
        ]
        .iter()
        .filter_map(|url| RelayUrl::parse(url).ok())
        .collect();

        Self {
            max_relays_per_author: 4,
            reduction_candidate_threshold: 10,
            min_coverage: 2,
            default_relays,
        }
    }
}

/// One relay with the authors whose content it serves for this query.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub relay: RelayUrl,
    pub authors: Vec<PublicKey>,
}

impl PlanEntry {
    /// The subscription filter for this relay, derived on read.
    pub fn filter(&self) -> Filter {
        Filter::new().authors(self.authors.iter().copied())
    }
}

/// A computed relay→filter mapping, consumed once by the subscribing feed.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPlan {
    pub entries: Vec<PlanEntry>,
}

impl SubscriptionPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// All relays in the plan, in order.
    pub fn relays(&self) -> impl Iterator<Item = &RelayUrl> {
        self.entries.iter().map(|e| &e.relay)
    }

    /// True if `author` appears in at least one entry's filter.
    pub fn covers(&self, author: &PublicKey) -> bool {
        self.entries.iter().any(|e| e.authors.contains(author))
    }
}

/// Computes subscription plans. Stateless; preference lists are fetched per
/// call and discarded with the plan.
pub struct RelayDistributor {
    config: DistributorConfig,
}

impl RelayDistributor {
    pub fn new(config: DistributorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    /// Compute a plan covering `authors`.
    ///
    /// `self_author`, when present, is included as one more author but with
    /// its *read* relays preferred: your own feed lands where you read.
    /// Per-author fetch failures degrade to the default relay set; only a
    /// completely empty result is an error.
    pub async fn plan(
        &self,
        authors: &[PublicKey],
        self_author: Option<&PublicKey>,
        fetcher: &dyn PreferenceFetcher,
    ) -> Result<SubscriptionPlan> {
        let mut all_authors: Vec<PublicKey> = Vec::new();
        let mut seen_authors: HashSet<PublicKey> = HashSet::new();
        for author in authors.iter().chain(self_author) {
            if seen_authors.insert(*author) {
                all_authors.push(*author);
            }
        }

        if all_authors.is_empty() {
            tracing::debug!("plan requested for zero authors");
            return Ok(SubscriptionPlan::default());
        }

        // relay -> covered authors, insertion-ordered per author preference.
        let mut coverage: HashMap<RelayUrl, Vec<PublicKey>> = HashMap::new();
        let mut uncovered: Vec<PublicKey> = Vec::new();

        for author in &all_authors {
            let prefs = match fetcher.fetch(author).await {
                Ok(prefs) => prefs,
                Err(e) => {
                    counter!("relay_distributor_fetch_failures_total").increment(1);
                    tracing::debug!(author = %author, error = %e, "preference fetch failed");
                    Default::default()
                }
            };

            // Read-side preference for self; write-side for everyone else.
            let preferred: &[RelayUrl] = if Some(author) == self_author && !prefs.read.is_empty() {
                &prefs.read
            } else {
                prefs.preferred()
            };

            if preferred.is_empty() {
                uncovered.push(*author);
                continue;
            }

            for relay in preferred.iter().take(self.config.max_relays_per_author) {
                coverage.entry(relay.clone()).or_default().push(*author);
            }
        }

        // Authors without usable preferences ride on the default relays.
        if !uncovered.is_empty() {
            counter!("relay_distributor_fallbacks_total").increment(1);
            tracing::debug!(
                count = uncovered.len(),
                "authors without preferences assigned to default relays"
            );
            for relay in &self.config.default_relays {
                let covered = coverage.entry(relay.clone()).or_default();
                for author in &uncovered {
                    if !covered.contains(author) {
                        covered.push(*author);
                    }
                }
            }
        }

        if coverage.is_empty() {
            return Err(Error::EmptyPlan);
        }

        let entries = self.reduce(coverage);
        gauge!("relay_distributor_plan_relays").set(entries.len() as f64);

        Ok(SubscriptionPlan { entries })
    }

    /// Reduction pass: order candidates by covered-author count descending and
    /// drop a relay when every author it covers already holds `min_coverage`
    /// from relays kept earlier. Applies only when more than
    /// `reduction_candidate_threshold` candidates exist.
    fn reduce(&self, coverage: HashMap<RelayUrl, Vec<PublicKey>>) -> Vec<PlanEntry> {
        let mut candidates: Vec<(RelayUrl, Vec<PublicKey>)> = coverage.into_iter().collect();
        // Deterministic order: most authors first, URL as tie-break.
        candidates.sort_by(|a, b| {
            b.1.len()
                .cmp(&a.1.len())
                .then_with(|| a.0.to_string().cmp(&b.0.to_string()))
        });

        let reduction_applies = candidates.len() > self.config.reduction_candidate_threshold;
        let mut kept_coverage: HashMap<PublicKey, usize> = HashMap::new();
        let mut entries = Vec::new();

        for (relay, authors) in candidates {
            let redundant = reduction_applies
                && authors
                    .iter()
                    .all(|a| kept_coverage.get(a).copied().unwrap_or(0) >= self.config.min_coverage);
            if redundant {
                tracing::trace!(relay = %relay, "dropped redundant relay from plan");
                continue;
            }

            for author in &authors {
                *kept_coverage.entry(*author).or_insert(0) += 1;
            }
            entries.push(PlanEntry { relay, authors });
        }

        entries
    }
}

impl Default for RelayDistributor {
    fn default() -> Self {
        Self::new(DistributorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay_lists::{RelayPreferences, StaticPreferences};
    use nostr::Keys;

    fn author() -> PublicKey {
        Keys::generate().public_key()
    }

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_plan_shares_relays_across_authors() {
        let x = author();
        let y = author();
        let fetcher = StaticPreferences::new()
            .with_write_relays(x, &["wss://r1.example.com", "wss://r2.example.com"])
            .with_write_relays(y, &["wss://r1.example.com"]);

        let distributor = RelayDistributor::default();
        let plan = distributor.plan(&[x, y], None, &fetcher).await.unwrap();

        // Fewer than the reduction threshold: nothing is dropped.
        assert_eq!(plan.len(), 2);

        let r1 = plan
            .entries
            .iter()
            .find(|e| e.relay == url("wss://r1.example.com"))
            .unwrap();
        assert!(r1.authors.contains(&x) && r1.authors.contains(&y));

        let r2 = plan
            .entries
            .iter()
            .find(|e| e.relay == url("wss://r2.example.com"))
            .unwrap();
        assert_eq!(r2.authors, vec![x]);
    }

    #[tokio::test]
    async fn test_every_author_with_preferences_is_covered() {
        let authors: Vec<PublicKey> = (0..5).map(|_| author()).collect();
        let mut fetcher = StaticPreferences::new();
        for (i, a) in authors.iter().enumerate() {
            fetcher.insert(
                *a,
                RelayPreferences {
                    read: Vec::new(),
                    write: vec![url(&format!("wss://r{}.example.com", i))],
                    raw: Vec::new(),
                },
            );
        }

        let plan = RelayDistributor::default()
            .plan(&authors, None, &fetcher)
            .await
            .unwrap();
        for a in &authors {
            assert!(plan.covers(a), "author silently dropped from plan");
        }
    }

    #[tokio::test]
    async fn test_fallback_to_default_relays() {
        let x = author();
        let y = author();
        // Fetcher knows neither author: every fetch fails.
        let fetcher = StaticPreferences::new();

        let plan = RelayDistributor::default()
            .plan(&[x, y], None, &fetcher)
            .await
            .unwrap();

        assert!(!plan.is_empty());
        assert!(plan.covers(&x));
        assert!(plan.covers(&y));
        let defaults = DistributorConfig::default().default_relays;
        for entry in &plan.entries {
            assert!(defaults.contains(&entry.relay));
        }
    }

    #[tokio::test]
    async fn test_mixed_preferences_and_fallback() {
        let with_prefs = author();
        let without = author();
        let fetcher = StaticPreferences::new()
            .with_write_relays(with_prefs, &["wss://r1.example.com"]);

        let plan = RelayDistributor::default()
            .plan(&[with_prefs, without], None, &fetcher)
            .await
            .unwrap();

        assert!(plan.covers(&with_prefs));
        assert!(plan.covers(&without));
    }

    #[tokio::test]
    async fn test_reduction_caps_fan_out() {
        // Six authors all prefer the same two relays first, plus two unique
        // relays each: 14 candidates, well above the threshold of 10.
        let authors: Vec<PublicKey> = (0..6).map(|_| author()).collect();
        let mut fetcher = StaticPreferences::new();
        for (i, a) in authors.iter().enumerate() {
            fetcher.insert(
                *a,
                RelayPreferences {
                    read: Vec::new(),
                    write: vec![
                        url("wss://shared-a.example.com"),
                        url("wss://shared-b.example.com"),
                        url(&format!("wss://solo{}-a.example.com", i)),
                        url(&format!("wss://solo{}-b.example.com", i)),
                    ],
                    raw: Vec::new(),
                },
            );
        }

        let plan = RelayDistributor::default()
            .plan(&authors, None, &fetcher)
            .await
            .unwrap();

        // Every author already has coverage 2 from the shared relays, so all
        // solo relays are dropped.
        assert_eq!(plan.len(), 2);
        for a in &authors {
            assert!(plan.covers(a));
        }
    }

    #[tokio::test]
    async fn test_no_reduction_below_threshold() {
        // Three authors, disjoint relays: 6 candidates, below the threshold,
        // so even singly-covered relays survive.
        let authors: Vec<PublicKey> = (0..3).map(|_| author()).collect();
        let mut fetcher = StaticPreferences::new();
        for (i, a) in authors.iter().enumerate() {
            fetcher.insert(
                *a,
                RelayPreferences {
                    read: Vec::new(),
                    write: vec![
                        url(&format!("wss://r{}-a.example.com", i)),
                        url(&format!("wss://r{}-b.example.com", i)),
                    ],
                    raw: Vec::new(),
                },
            );
        }

        let plan = RelayDistributor::default()
            .plan(&authors, None, &fetcher)
            .await
            .unwrap();
        assert_eq!(plan.len(), 6);
    }

    #[tokio::test]
    async fn test_empty_plan_is_hard_error() {
        let x = author();
        let fetcher = StaticPreferences::new();
        let distributor = RelayDistributor::new(DistributorConfig {
            default_relays: Vec::new(),
            ..Default::default()
        });

        assert!(matches!(
            distributor.plan(&[x], None, &fetcher).await,
            Err(Error::EmptyPlan)
        ));
    }

    #[tokio::test]
    async fn test_self_author_prefers_read_relays() {
        let me = author();
        let mut fetcher = StaticPreferences::new();
        fetcher.insert(
            me,
            RelayPreferences {
                read: vec![url("wss://my-inbox.example.com")],
                write: vec![url("wss://my-outbox.example.com")],
                raw: Vec::new(),
            },
        );

        let plan = RelayDistributor::default()
            .plan(&[], Some(&me), &fetcher)
            .await
            .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.entries[0].relay, url("wss://my-inbox.example.com"));
    }
}
