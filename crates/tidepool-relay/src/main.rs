//! Headless Tidepool feed daemon.
//!
//! Connects to the relay network, plans a subscription over the given
//! authors, and prints batched feed events. This is the library's full path
//! exercised end to end without any UI: distribution → selection → pooled
//! connections → buffered delivery.
//!
//! # Usage
//!
//! ```bash
//! # Follow two authors (hex or bech32 pubkeys), default bootstrap relays
//! tidepool-feed --authors npub1...,npub1...
//!
//! # Custom bootstrap relays and tighter connection caps
//! tidepool-feed \
//!     --authors <pubkey> \
//!     --bootstrap-relays wss://relay.damus.io,wss://nos.lol \
//!     --max-connections 10
//! ```
//!
//! Shutdown: Ctrl-C closes the subscription, releases all pooled
//! connections and exits cleanly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use nostr::{Keys, PublicKey, RelayUrl};
use tracing_subscriber::EnvFilter;

use tidepool_relay::relay_lists::RelayListFetcher;
use tidepool_relay::strategy::QueryPurpose;
use tidepool_relay::{
    DistributorConfig, PoolConfig, RelayContext, Settings, SubscriptionHandlers,
};

/// Headless Tidepool feed daemon.
#[derive(Parser, Debug)]
#[command(name = "tidepool-feed")]
#[command(about = "Stream a relay-network feed for a set of authors")]
#[command(version)]
struct Args {
    /// Authors to follow (hex or bech32 public keys, comma-separated)
    #[arg(long, value_delimiter = ',', required = true)]
    authors: Vec<String>,

    /// Bootstrap relays used for relay-list discovery (comma-separated)
    #[arg(long, value_delimiter = ',')]
    bootstrap_relays: Option<Vec<String>>,

    /// Query purpose tuning the buffer (events, realtime, profile, ...)
    #[arg(long, default_value = "events")]
    purpose: QueryPurpose,

    /// Maximum total relay connections
    #[arg(long, default_value = "20")]
    max_connections: usize,

    /// Maximum connections per relay
    #[arg(long, default_value = "3")]
    max_per_relay: usize,

    /// Connection timeout in seconds
    #[arg(long, default_value = "10")]
    connect_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs
    // are present in the dependency tree).
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("tidepool_relay=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let authors: Vec<PublicKey> = args
        .authors
        .iter()
        .map(|s| PublicKey::parse(s).with_context(|| format!("invalid author key '{}'", s)))
        .collect::<Result<_>>()?;

    let bootstrap: Vec<RelayUrl> = match &args.bootstrap_relays {
        Some(urls) => urls
            .iter()
            .map(|u| {
                tidepool_core::parse_relay_url(u)
                    .with_context(|| format!("invalid bootstrap relay '{}'", u))
            })
            .collect::<Result<_>>()?,
        None => DistributorConfig::default().default_relays,
    };

    let settings = Settings {
        pool: PoolConfig {
            max_total_connections: args.max_connections,
            max_connections_per_relay: args.max_per_relay,
            connection_timeout: Duration::from_secs(args.connect_timeout),
            ..Default::default()
        },
        distributor: DistributorConfig {
            default_relays: bootstrap.clone(),
            ..Default::default()
        },
        ..Default::default()
    };

    let ctx = RelayContext::new(settings);

    // Ephemeral keypair for NIP-42: auth-only, never used to publish.
    let keys = Keys::generate();
    tracing::info!(pubkey = %keys.public_key(), "generated ephemeral auth keypair");
    ctx.set_signer(Arc::new(keys));

    tracing::info!(
        authors = authors.len(),
        bootstrap = bootstrap.len(),
        "planning feed subscription"
    );

    let fetcher = RelayListFetcher::new(Arc::clone(ctx.pool()), bootstrap);
    let plan = ctx.plan(&authors, None, &fetcher).await?;
    for entry in &plan.entries {
        tracing::info!(relay = %entry.relay, authors = entry.authors.len(), "plan entry");
    }

    let handlers = SubscriptionHandlers::new()
        .on_events(|batch, is_final| {
            for event in batch {
                println!(
                    "[{}] {} {}: {}",
                    event.created_at,
                    event.kind,
                    event.pubkey,
                    event.content.replace('\n', " ")
                );
            }
            if is_final {
                tracing::info!(count = batch.len(), "initial backlog complete");
            }
        })
        .on_new_event(|event| {
            tracing::debug!(id = %event.id, "live event");
        })
        .on_close(|endpoint, reason| {
            tracing::warn!(endpoint = %endpoint, reason = %reason, "relay leg closed");
        });

    let handle = ctx.subscribe(plan, args.purpose, handlers).await?;
    tracing::info!(relays = handle.relay_count(), "subscription running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    let stats = handle.stats();
    tracing::info!(
        ingested = stats.ingested,
        delivered = stats.delivered,
        duplicates = stats.duplicates,
        stale = stats.stale,
        "final buffer stats"
    );

    handle.close();
    ctx.shutdown();
    Ok(())
}
