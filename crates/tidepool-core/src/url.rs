//! Relay URL normalization and validation.
//!
//! Relay URLs arrive from many places: configured seed lists, other users'
//! relay-preference events, discovery. The same relay is routinely written as
//! `wss://Relay.Example.COM/`, `wss://relay.example.com` and
//! `wss://relay.example.com/`, so every URL is normalized before it is used as
//! a pool or health-monitor key.
//!
//! # Normalization Rules
//!
//! - Remove trailing slashes
//! - Lowercase the scheme and host
//! - Preserve port numbers and paths
//! - Require a websocket scheme (wss:// or ws://)
//!
//! # Filtering Rules
//!
//! Preference lists are user-controlled data, so hosts that would make the
//! client dial into private infrastructure are rejected:
//! - localhost, 127.x, 0.0.0.0
//! - Private IPv4 ranges (10/8, 172.16/12, 192.168/16)
//! - CGNAT/shared space (100.64.0.0/10) and link-local (169.254/16)
//! - IPv6 loopback, link-local, unique-local, IPv4-mapped
//! - .onion addresses (unless `allow_onion` is set) and .local (mDNS)
//! - Non-standard ports (only common websocket/relay ports allowed)

use nostr::RelayUrl;
use thiserror::Error;

/// Error returned by [`parse_relay_url`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlError {
    /// URL is syntactically invalid.
    #[error("invalid relay URL: {0}")]
    Invalid(String),
    /// URL matches a blocklist pattern.
    #[error("blocked relay URL: {0}")]
    Blocked(String),
}

/// Options for URL normalization.
#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    /// Allow .onion (Tor hidden service) addresses.
    ///
    /// When false (default), .onion addresses are blocked. Set to true when
    /// the embedding application routes through a Tor proxy.
    pub allow_onion: bool,
}

/// Result of URL normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeResult {
    /// URL is valid and normalized.
    Ok(String),
    /// URL is syntactically invalid.
    Invalid(String),
    /// URL matches a blocklist pattern.
    Blocked(String),
}

impl NormalizeResult {
    /// Returns the normalized URL if valid.
    pub fn ok(self) -> Option<String> {
        match self {
            Self::Ok(url) => Some(url),
            _ => None,
        }
    }

    /// Returns true if the URL is valid.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Normalize a relay URL with default options (.onion blocked).
pub fn normalize_relay_url(url: &str) -> NormalizeResult {
    normalize_relay_url_with_opts(url, &NormalizeOptions::default())
}

/// Normalize a relay URL with custom options.
pub fn normalize_relay_url_with_opts(url: &str, opts: &NormalizeOptions) -> NormalizeResult {
    let url = url.trim();

    if !url.starts_with("wss://") && !url.starts_with("ws://") {
        return NormalizeResult::Invalid("URL must start with wss:// or ws://".to_string());
    }

    // Parse to validate structure; RelayUrl lowercases scheme and host.
    let parsed = match RelayUrl::parse(url) {
        Ok(u) => u,
        Err(e) => return NormalizeResult::Invalid(format!("unparseable relay URL: {}", e)),
    };

    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }

    if let Some(reason) = check_blocklist(&normalized, opts) {
        return NormalizeResult::Blocked(reason);
    }

    NormalizeResult::Ok(normalized)
}

/// Normalize and parse a relay URL into a [`RelayUrl`] in one step.
///
/// This is the form most of the relay layer wants: pool and health-monitor
/// keys are `RelayUrl` values, and they must always be normalized.
pub fn parse_relay_url(url: &str) -> Result<RelayUrl, UrlError> {
    match normalize_relay_url(url) {
        NormalizeResult::Ok(u) => {
            RelayUrl::parse(&u).map_err(|e| UrlError::Invalid(e.to_string()))
        }
        NormalizeResult::Invalid(reason) => Err(UrlError::Invalid(reason)),
        NormalizeResult::Blocked(reason) => Err(UrlError::Blocked(reason)),
    }
}

/// Ports that are allowed for relay connections.
///
/// Only standard websocket ports and common relay ports are permitted; odd
/// ports in preference lists are usually misconfigured home servers.
const ALLOWED_PORTS: &[u16] = &[
    80,   // HTTP (ws://)
    443,  // HTTPS (wss://) - default, usually omitted from URL
    8080, // Common HTTP alt
    8443, // Common HTTPS alt
    8008, // Common relay port
    3000, // Dev/alt relay port
    7777, // Some relays use this
];

/// Check if a URL matches any blocklist pattern.
///
/// Returns `Some(reason)` if blocked, `None` if allowed.
fn check_blocklist(url: &str, opts: &NormalizeOptions) -> Option<String> {
    let host = extract_host(url);

    if host == "localhost" || host.starts_with("localhost:") {
        return Some("localhost not allowed".to_string());
    }
    if host.starts_with("0.0.0.0") {
        return Some("unspecified address (0.0.0.0) not allowed".to_string());
    }
    if host.starts_with("127.") {
        return Some("loopback address not allowed".to_string());
    }
    if host.starts_with("192.168.") {
        return Some("private IP (192.168.x.x) not allowed".to_string());
    }
    if host.starts_with("10.") {
        return Some("private IP (10.x.x.x) not allowed".to_string());
    }
    // 172.16.0.0 - 172.31.255.255
    if host.starts_with("172.") {
        if let Some(second) = host.split('.').nth(1) {
            if let Ok(n) = second.parse::<u8>() {
                if (16..=31).contains(&n) {
                    return Some("private IP (172.16-31.x.x) not allowed".to_string());
                }
            }
        }
    }
    // CGNAT / shared address space (RFC 6598)
    if host.starts_with("100.") {
        if let Some(second) = host.split('.').nth(1) {
            if let Ok(n) = second.parse::<u8>() {
                if (64..=127).contains(&n) {
                    return Some("CGNAT/shared address (100.64-127.x.x) not allowed".to_string());
                }
            }
        }
    }
    if host.starts_with("169.254.") {
        return Some("link-local address (169.254.x.x) not allowed".to_string());
    }
    if host.starts_with("[::1]") {
        return Some("IPv6 loopback (::1) not allowed".to_string());
    }
    if host.starts_with("[fe80:") {
        return Some("IPv6 link-local (fe80::) not allowed".to_string());
    }
    if host.starts_with("[fc") || host.starts_with("[fd") {
        return Some("IPv6 unique local (fc00::/7) not allowed".to_string());
    }
    // IPv4-mapped IPv6 could bypass the IPv4 checks above
    if host.starts_with("[::ffff:") {
        return Some("IPv4-mapped IPv6 (::ffff:) not allowed".to_string());
    }
    if !opts.allow_onion && (host.ends_with(".onion") || host.contains(".onion:")) {
        return Some(".onion addresses not allowed (enable Tor support to allow)".to_string());
    }
    if host.ends_with(".local") || host.contains(".local:") {
        return Some(".local addresses not allowed".to_string());
    }
    if host.is_empty() || host == ":" {
        return Some("empty host not allowed".to_string());
    }
    if host.len() < 3 {
        return Some("host too short".to_string());
    }

    // Port filtering; .onion relays often use odd ports, so they skip it.
    if !host.contains(".onion") {
        if let Some(port) = extract_port(url) {
            if !ALLOWED_PORTS.contains(&port) {
                return Some(format!("non-standard port {} not allowed", port));
            }
        }
    }

    None
}

/// Extract the host portion from a websocket URL.
fn extract_host(url: &str) -> &str {
    let without_scheme = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);

    without_scheme.split('/').next().unwrap_or(without_scheme)
}

/// Extract the port number from a websocket URL, if explicitly specified.
fn extract_port(url: &str) -> Option<u16> {
    let host = extract_host(url);

    // IPv6 addresses like [::1]:8080
    if let Some(bracket_end) = host.rfind(']') {
        let after_bracket = &host[bracket_end + 1..];
        if let Some(port_str) = after_bracket.strip_prefix(':') {
            return port_str.parse().ok();
        }
        return None;
    }

    if let Some(colon_pos) = host.rfind(':') {
        return host[colon_pos + 1..].parse().ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_basic() {
        assert_eq!(
            normalize_relay_url("wss://Relay.Example.COM/").ok(),
            Some("wss://relay.example.com".to_string())
        );
        assert_eq!(
            normalize_relay_url("wss://relay.example.com").ok(),
            Some("wss://relay.example.com".to_string())
        );
        assert_eq!(
            normalize_relay_url("ws://relay.example.com:8080").ok(),
            Some("ws://relay.example.com:8080".to_string())
        );
    }

    #[test]
    fn test_normalize_rejects_non_websocket() {
        assert!(matches!(
            normalize_relay_url("https://relay.example.com"),
            NormalizeResult::Invalid(_)
        ));
        assert!(matches!(
            normalize_relay_url("relay.example.com"),
            NormalizeResult::Invalid(_)
        ));
    }

    #[test]
    fn test_blocklist_localhost_and_loopback() {
        assert!(matches!(
            normalize_relay_url("wss://localhost:8080"),
            NormalizeResult::Blocked(_)
        ));
        assert!(matches!(
            normalize_relay_url("ws://127.0.0.1"),
            NormalizeResult::Blocked(_)
        ));
        assert!(matches!(
            normalize_relay_url("ws://0.0.0.0:8080"),
            NormalizeResult::Blocked(_)
        ));
    }

    #[test]
    fn test_blocklist_private_ranges() {
        for url in [
            "wss://192.168.1.10",
            "wss://10.0.0.5",
            "wss://172.16.0.1",
            "wss://172.31.255.255",
            "wss://100.64.0.1",
            "wss://169.254.1.1",
        ] {
            assert!(
                matches!(normalize_relay_url(url), NormalizeResult::Blocked(_)),
                "expected {} to be blocked",
                url
            );
        }
        // 172.15 and 172.32 are public space
        assert!(normalize_relay_url("wss://172.15.0.1").is_ok());
        assert!(normalize_relay_url("wss://172.32.0.1").is_ok());
    }

    #[test]
    fn test_blocklist_onion_and_local() {
        assert!(matches!(
            normalize_relay_url("ws://somerelay.onion"),
            NormalizeResult::Blocked(_)
        ));
        assert!(matches!(
            normalize_relay_url("wss://nas.local"),
            NormalizeResult::Blocked(_)
        ));

        let opts = NormalizeOptions { allow_onion: true };
        assert!(normalize_relay_url_with_opts("ws://somerelay.onion", &opts).is_ok());
    }

    #[test]
    fn test_port_allowlist() {
        assert!(normalize_relay_url("wss://relay.example.com:8443").is_ok());
        assert!(matches!(
            normalize_relay_url("wss://relay.example.com:31337"),
            NormalizeResult::Blocked(_)
        ));
    }

    #[test]
    fn test_parse_relay_url() {
        let url = parse_relay_url("wss://Relay.Example.COM/").unwrap();
        assert_eq!(url.to_string(), "wss://relay.example.com");

        assert!(matches!(
            parse_relay_url("wss://localhost"),
            Err(UrlError::Blocked(_))
        ));
        assert!(matches!(
            parse_relay_url("http://relay.example.com"),
            Err(UrlError::Invalid(_))
        ));
    }
}
