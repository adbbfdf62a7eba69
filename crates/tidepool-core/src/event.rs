//! Event age helpers for the live-feed layer.
//!
//! A live feed only cares about recent events; relays frequently replay old
//! stored events on new subscriptions, and a few send events with absurd
//! timestamps. These helpers centralize the age arithmetic so every component
//! judges staleness the same way.

use std::time::Duration;

use nostr::{Event, Timestamp};

use crate::NOSTR_GENESIS_TIMESTAMP;

/// Age of an event in seconds relative to `now`.
///
/// Events with a `created_at` in the future have age 0; clock skew between
/// relays and clients is common and a slightly-future event is not stale.
pub fn event_age_secs(event: &Event, now: Timestamp) -> u64 {
    now.as_u64().saturating_sub(event.created_at.as_u64())
}

/// True if the event's `created_at` is more than `max_age` before `now`.
pub fn is_older_than(event: &Event, now: Timestamp, max_age: Duration) -> bool {
    event_age_secs(event, now) > max_age.as_secs()
}

/// True if the event's timestamp falls in the plausible range: not before the
/// protocol genesis date and not more than `max_future_skew` ahead of `now`.
pub fn is_plausible_timestamp(event: &Event, now: Timestamp, max_future_skew: Duration) -> bool {
    let created = event.created_at.as_u64();
    created >= NOSTR_GENESIS_TIMESTAMP && created <= now.as_u64() + max_future_skew.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind};

    fn event_at(created_at: u64) -> Event {
        let keys = Keys::generate();
        EventBuilder::new(Kind::TextNote, "test")
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(&keys)
            .unwrap()
    }

    #[test]
    fn test_event_age() {
        let now = Timestamp::from(1_700_000_000);
        let event = event_at(1_700_000_000 - 120);
        assert_eq!(event_age_secs(&event, now), 120);

        // Future events clamp to zero age
        let future = event_at(1_700_000_000 + 60);
        assert_eq!(event_age_secs(&future, now), 0);
    }

    #[test]
    fn test_is_older_than() {
        let now = Timestamp::from(1_700_000_000);
        let event = event_at(1_700_000_000 - 3601);
        assert!(is_older_than(&event, now, Duration::from_secs(3600)));
        assert!(!is_older_than(&event, now, Duration::from_secs(7200)));
    }

    #[test]
    fn test_plausible_timestamp() {
        let now = Timestamp::from(1_700_000_000);
        let skew = Duration::from_secs(900);

        assert!(is_plausible_timestamp(&event_at(1_699_999_000), now, skew));
        // Before genesis
        assert!(!is_plausible_timestamp(&event_at(1_000_000_000), now, skew));
        // Too far in the future
        assert!(!is_plausible_timestamp(
            &event_at(1_700_000_000 + 86400),
            now,
            skew
        ));
    }
}
