//! Author relay preferences (NIP-65 relay lists).
//!
//! Authors publish where they write and where they read as `kind:10002`
//! events with `r` tags. The distributor only consumes the parsed
//! [`RelayPreferences`] value; where it comes from is behind the
//! [`PreferenceFetcher`] seam so the profile/metadata resolver of the
//! embedding app (or a test map) can supply it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, Filter, Kind, PublicKey, RelayUrl, SubscriptionId};

use crate::pool::{ConnectionPool, RelayIncoming};
use crate::{Error, Result};

/// Per-author relay preference lists.
///
/// `read`/`write` hold normalized, blocklist-filtered URLs; `raw` keeps the
/// list exactly as received (useful for diagnostics, never dialed).
#[derive(Debug, Clone, Default)]
pub struct RelayPreferences {
    pub read: Vec<RelayUrl>,
    pub write: Vec<RelayUrl>,
    pub raw: Vec<String>,
}

impl RelayPreferences {
    /// True when neither list has a usable relay.
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }

    /// The relays to query for this author's content: where the author
    /// writes, falling back to where they read.
    pub fn preferred(&self) -> &[RelayUrl] {
        if !self.write.is_empty() {
            &self.write
        } else {
            &self.read
        }
    }
}

/// Parse a `kind:10002` relay-list event into preferences.
///
/// Tags look like `["r", "wss://relay.example.com"]` with an optional
/// `read`/`write` marker; no marker means both. Invalid or blocked URLs are
/// kept in `raw` but excluded from the usable lists.
pub fn parse_relay_list(event: &Event) -> RelayPreferences {
    let mut prefs = RelayPreferences::default();

    for tag in event.tags.iter() {
        let fields = tag.as_slice();
        if fields.first().map(String::as_str) != Some("r") || fields.len() < 2 {
            continue;
        }
        let raw_url = fields[1].as_str();
        prefs.raw.push(raw_url.to_string());

        let url = match tidepool_core::parse_relay_url(raw_url) {
            Ok(url) => url,
            Err(e) => {
                tracing::trace!(url = raw_url, reason = %e, "skipping relay-list entry");
                continue;
            }
        };

        match fields.get(2).map(String::as_str) {
            Some("read") => prefs.read.push(url),
            Some("write") => prefs.write.push(url),
            _ => {
                prefs.read.push(url.clone());
                prefs.write.push(url);
            }
        }
    }

    prefs
}

/// Source of per-author relay preferences.
///
/// A failing fetch degrades that author to an empty preference list; it must
/// never abort a whole distribution.
#[async_trait]
pub trait PreferenceFetcher: Send + Sync {
    async fn fetch(&self, author: &PublicKey) -> Result<RelayPreferences>;
}

/// Map-backed fetcher for tests and static configurations.
#[derive(Debug, Clone, Default)]
pub struct StaticPreferences {
    entries: HashMap<PublicKey, RelayPreferences>,
}

impl StaticPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an author with write relays (the common case in tests).
    pub fn with_write_relays(mut self, author: PublicKey, relays: &[&str]) -> Self {
        let write: Vec<RelayUrl> = relays
            .iter()
            .filter_map(|url| tidepool_core::parse_relay_url(url).ok())
            .collect();
        let raw = relays.iter().map(|s| s.to_string()).collect();
        self.entries.insert(
            author,
            RelayPreferences {
                read: Vec::new(),
                write,
                raw,
            },
        );
        self
    }

    /// Add an author with full preferences.
    pub fn insert(&mut self, author: PublicKey, prefs: RelayPreferences) {
        self.entries.insert(author, prefs);
    }
}

#[async_trait]
impl PreferenceFetcher for StaticPreferences {
    async fn fetch(&self, author: &PublicKey) -> Result<RelayPreferences> {
        self.entries
            .get(author)
            .cloned()
            .ok_or_else(|| Error::PreferenceFetchFailed {
                author: *author,
                reason: "no preference entry".to_string(),
            })
    }
}

/// Fetcher that asks bootstrap relays for the author's relay-list event over
/// pooled connections. This is the client's cold-start path before any
/// profile cache exists.
pub struct RelayListFetcher {
    pool: Arc<ConnectionPool>,
    bootstrap_relays: Vec<RelayUrl>,
    timeout: Duration,
}

impl RelayListFetcher {
    pub fn new(pool: Arc<ConnectionPool>, bootstrap_relays: Vec<RelayUrl>) -> Self {
        Self {
            pool,
            bootstrap_relays,
            timeout: Duration::from_secs(5),
        }
    }

    /// Override the per-relay wait budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Query one relay for the author's relay list.
    async fn query_relay(
        &self,
        endpoint: &RelayUrl,
        author: &PublicKey,
    ) -> Result<Option<RelayPreferences>> {
        let conn = self.pool.acquire(endpoint).await?;
        let sub_id = SubscriptionId::generate();
        let filter = Filter::new()
            .author(*author)
            .kind(Kind::RelayList)
            .limit(1);

        // Subscribe before sending REQ so the response cannot be missed.
        let mut incoming = conn.subscribe_incoming();
        if let Err(e) = conn.send_req(&sub_id, &filter).await {
            self.pool.release(endpoint, &conn);
            return Err(e);
        }

        let result = tokio::time::timeout(self.timeout, async {
            loop {
                match incoming.recv().await {
                    Ok(RelayIncoming::Event {
                        subscription_id,
                        event,
                    }) if subscription_id == sub_id => {
                        if event.kind == Kind::RelayList {
                            return Some(parse_relay_list(&event));
                        }
                    }
                    Ok(RelayIncoming::EndOfStoredEvents { subscription_id })
                        if subscription_id == sub_id =>
                    {
                        return None;
                    }
                    Ok(RelayIncoming::Disconnected { .. }) => return None,
                    Ok(_) => {}
                    Err(_) => return None,
                }
            }
        })
        .await
        .unwrap_or(None);

        let _ = conn.send_close_sub(&sub_id).await;
        self.pool.release(endpoint, &conn);
        Ok(result)
    }
}

#[async_trait]
impl PreferenceFetcher for RelayListFetcher {
    async fn fetch(&self, author: &PublicKey) -> Result<RelayPreferences> {
        for endpoint in &self.bootstrap_relays {
            match self.query_relay(endpoint, author).await {
                Ok(Some(prefs)) => return Ok(prefs),
                Ok(None) => continue,
                Err(e) if e.is_skippable() => {
                    tracing::debug!(endpoint = %endpoint, author = %author, error = %e, "relay-list query failed");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::PreferenceFetchFailed {
            author: *author,
            reason: "no bootstrap relay returned a relay list".to_string(),
        })
    }
}
