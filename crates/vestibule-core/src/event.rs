//! The change-notification event taxonomy.
//!
//! Every mutation expected to change observable state publishes a short event
//! string of the form `{settings|queue|store}:<verb>` on the per-prefix
//! events channel. The channel is a notification bus, not a data feed:
//! consumers match the payload against a pattern and re-fetch whatever state
//! they care about.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::error::Error;

/// Pattern matching every event the core publishes.
pub static CANONICAL_EVENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^(settings|queue|store):").expect("canonical event pattern is valid")
});

/// A change notification published on the events channel.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// The enabled flag, capacity, or both were written.
    SettingsUpdated,
    /// The waiting-page blob was replaced.
    WaitingPageUpdated,
    /// A session was appended to the queue.
    QueueAdded,
    /// A session was removed from the queue by the caller.
    QueueRemoved,
    /// Queued sessions were dropped by an expiry sweep.
    QueueExpired,
    /// A session was admitted directly into the store.
    StoreAdded,
    /// Admitted sessions were dropped by an expiry sweep.
    StoreExpired,
    /// Sessions moved from the queue into freed store slots.
    StorePromoted,
}

impl AdmissionEvent {
    /// Returns the wire payload for this event.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SettingsUpdated => "settings:updated",
            Self::WaitingPageUpdated => "settings:waiting_page",
            Self::QueueAdded => "queue:added",
            Self::QueueRemoved => "queue:removed",
            Self::QueueExpired => "queue:expired",
            Self::StoreAdded => "store:added",
            Self::StoreExpired => "store:expired",
            Self::StorePromoted => "store:promoted",
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<AdmissionEvent> for String {
    fn from(event: AdmissionEvent) -> Self {
        event.as_str().to_string()
    }
}

impl TryFrom<&str> for AdmissionEvent {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "settings:updated" => Ok(Self::SettingsUpdated),
            "settings:waiting_page" => Ok(Self::WaitingPageUpdated),
            "queue:added" => Ok(Self::QueueAdded),
            "queue:removed" => Ok(Self::QueueRemoved),
            "queue:expired" => Ok(Self::QueueExpired),
            "store:added" => Ok(Self::StoreAdded),
            "store:expired" => Ok(Self::StoreExpired),
            "store:promoted" => Ok(Self::StorePromoted),
            _ => Err(Error::UnknownEvent(String::from(value))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[AdmissionEvent] = &[
        AdmissionEvent::SettingsUpdated,
        AdmissionEvent::WaitingPageUpdated,
        AdmissionEvent::QueueAdded,
        AdmissionEvent::QueueRemoved,
        AdmissionEvent::QueueExpired,
        AdmissionEvent::StoreAdded,
        AdmissionEvent::StoreExpired,
        AdmissionEvent::StorePromoted,
    ];

    #[test]
    fn wire_round_trip() {
        for event in ALL {
            let parsed = AdmissionEvent::try_from(event.as_str()).expect("parse");
            assert_eq!(parsed, *event);
        }
    }

    #[test]
    fn every_event_matches_the_canonical_pattern() {
        for event in ALL {
            assert!(
                CANONICAL_EVENT_PATTERN.is_match(event.as_str()),
                "{event} escapes the taxonomy"
            );
        }
    }

    #[test]
    fn unknown_payloads_are_rejected() {
        assert!(matches!(
            AdmissionEvent::try_from("upstream:died"),
            Err(Error::UnknownEvent(_))
        ));
    }
}
