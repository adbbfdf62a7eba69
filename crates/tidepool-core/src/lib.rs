//! Core types and shared utilities for the Tidepool relay layer.
//!
//! This crate provides:
//! - Relay URL normalization and blocklist filtering
//! - Event age helpers used by the live-feed buffering layer
//! - Shared error types

pub mod event;
pub mod url;

/// Nostr genesis date: November 7, 2020.
/// Events claiming a `created_at` before this date are bogus and are treated
/// as stale by the feed layer.
pub const NOSTR_GENESIS_TIMESTAMP: u64 = 1604707200; // 2020-11-07 00:00:00 UTC

pub use event::{event_age_secs, is_older_than, is_plausible_timestamp};
pub use url::{
    normalize_relay_url, normalize_relay_url_with_opts, parse_relay_url, NormalizeOptions,
    NormalizeResult, UrlError,
};
