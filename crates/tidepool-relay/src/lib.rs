//! Relay connection and distribution layer for the Tidepool client.
//!
//! Tidepool talks to a decentralized relay network: many independent servers
//! hold overlapping slices of signed, content-addressed events, and any
//! author's content may live on a different subset of relays. This crate is
//! the layer that decides *which* relays to talk to for every query, *how
//! many* duplex connections to keep open, *when* a relay is healthy enough
//! to trust, and *how* to merge the resulting event streams into a single
//! deduplicated feed.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   plan    ┌──────────────────┐
//! │ RelayDistributor│─────────▶│ StrategySelector │
//! └───────┬────────┘           └────────┬─────────┘
//!         │ SubscriptionPlan            │ relay subset
//!         ▼                             ▼
//! ┌─────────────────────────────────────────────┐
//! │                 subscribe()                 │
//! │  one leg per relay: acquire → REQ → route   │
//! └───────┬─────────────────────────┬───────────┘
//!         │                         │ raw events
//!         ▼                         ▼
//! ┌────────────────┐      ┌───────────────────┐
//! │ ConnectionPool │      │ EventStreamBuffer │──▶ batched feed
//! └───────┬────────┘      └───────────────────┘
//!         │ open/close/latency
//!         ▼
//! ┌────────────────┐      ┌──────────────────────┐
//! │ HealthMonitor  │      │ AuthChallengeManager │
//! └────────────────┘      └──────────────────────┘
//! ```
//!
//! The pool owns every socket; the health monitor observes outcomes and
//! ranks relays; the distributor shards authors across their preferred
//! relays; the selector picks purpose-appropriate subsets; the buffer
//! deduplicates and batches; the auth manager answers NIP-42 challenges.
//! [`context::RelayContext`] wires it all together with no hidden globals.
//!
//! Failure philosophy: anything local to one relay (dial timeout, capacity,
//! auth demand) degrades coverage, never correctness. The only hard failure
//! a caller sees is [`Error::EmptyPlan`].

pub mod auth;
pub mod buffer;
pub mod context;
pub mod distributor;
pub mod error;
pub mod health;
pub mod pool;
pub mod relay_lists;
pub mod strategy;
pub mod subscribe;

pub use error::{Error, Result};

// Re-export the working surface at crate root
pub use auth::{AuthChallengeManager, AuthConfig, AuthStatus};
pub use buffer::{BufferConfig, BufferStats, EventStreamBuffer, FlushReason, IngestOutcome};
pub use context::{RelayContext, Settings};
pub use distributor::{DistributorConfig, PlanEntry, RelayDistributor, SubscriptionPlan};
pub use health::{HealthConfig, HealthMetrics, HealthMonitor, HealthTransition, ProbeConfig};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, RelayConnection, RelayIncoming};
pub use relay_lists::{
    parse_relay_list, PreferenceFetcher, RelayListFetcher, RelayPreferences, StaticPreferences,
};
pub use strategy::{QueryPurpose, SelectOptions, SelectionStrategy, StrategySelector};
pub use subscribe::{subscribe, SubscriptionHandle, SubscriptionHandlers};
