//! Error types for the relay layer.
//!
//! Failures local to a single relay (dial timeouts, capacity, auth demands)
//! are *skippable*: callers drop that relay from the working set and carry on
//! with the rest of the plan. Only [`Error::EmptyPlan`] is a hard failure for
//! a query.

use std::time::Duration;

use nostr::{PublicKey, RelayUrl};
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the relay layer.
#[derive(Error, Debug)]
pub enum Error {
    /// Pool is at its per-relay or global connection cap.
    ///
    /// Skippable: try again later or pick another relay.
    #[error("connection capacity exceeded for {endpoint}: {reason}")]
    CapacityExceeded { endpoint: RelayUrl, reason: String },

    /// Dial did not complete within the configured timeout.
    #[error("connection to {endpoint} timed out after {timeout:?}")]
    ConnectionTimeout { endpoint: RelayUrl, timeout: Duration },

    /// Dial failed or the socket dropped during establishment.
    #[error("connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: RelayUrl, reason: String },

    /// The relay demands NIP-42 authentication before serving this request.
    #[error("relay {endpoint} requires authentication")]
    AuthRequired { endpoint: RelayUrl },

    /// Authentication was attempted `attempts` times without success; the
    /// endpoint is excluded from further use this session.
    #[error("auth retry budget exhausted for {endpoint} after {attempts} attempts")]
    AuthRetryExhausted { endpoint: RelayUrl, attempts: u32 },

    /// Relay preference fetch failed for one author. The distributor absorbs
    /// this per author and falls back to the default relay set.
    #[error("relay preference fetch failed for {author}: {reason}")]
    PreferenceFetchFailed { author: PublicKey, reason: String },

    /// No relay could be produced for this query, even after fallback.
    #[error("no relay could be selected for this query")]
    EmptyPlan,

    /// Invalid relay URL.
    #[error("invalid relay URL: {0}")]
    Url(#[from] tidepool_core::UrlError),

    /// Malformed or unexpected protocol message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    Websocket(String),

    /// Signer refused or failed to produce an auth event.
    #[error("signer error: {0}")]
    Signer(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for failures that are local to one relay and should degrade
    /// coverage rather than abort a multi-relay query.
    pub fn is_skippable(&self) -> bool {
        !matches!(self, Self::EmptyPlan)
    }
}
