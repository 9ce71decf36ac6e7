//! Typed queue/store control values and snapshots.
//!
//! Redis stores every control value as a string, so the types here carry the
//! conversion lattice between wire strings, integers, and the domain values
//! the rest of the system works with. Missing keys have defined meanings
//! (capacity missing → unbounded, enabled missing → disabled) rather than
//! being errors.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Upper bound on the number of concurrently admitted sessions.
///
/// Negative wire values mean unbounded; zero means closed (admit none).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreCapacity {
    /// At most this many sessions may hold store slots.
    Sized(u64),
    /// No bound on admitted sessions; the queue drains entirely.
    Unlimited,
}

impl StoreCapacity {
    /// Returns whether a store currently holding `store_size` sessions can
    /// admit one more.
    #[must_use]
    pub fn admits(&self, store_size: u64) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Sized(cap) => store_size < *cap,
        }
    }
}

impl TryFrom<i64> for StoreCapacity {
    type Error = Error;

    fn try_from(size: i64) -> Result<Self> {
        match size {
            ..=-2 => Err(Error::CapacityOutOfRange(size.to_string())),
            -1 => Ok(Self::Unlimited),
            0.. => Ok(Self::Sized(size.unsigned_abs())),
        }
    }
}

impl TryFrom<&str> for StoreCapacity {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value.trim().parse::<i64>() {
            Ok(v) => Self::try_from(v),
            Err(_) => Err(Error::CapacityOutOfRange(String::from(value))),
        }
    }
}

impl TryFrom<String> for StoreCapacity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::try_from(value.as_str())
    }
}

impl TryFrom<Option<String>> for StoreCapacity {
    type Error = Error;

    fn try_from(value: Option<String>) -> Result<Self> {
        match value {
            Some(v) => Self::try_from(v),
            None => Ok(Self::Unlimited),
        }
    }
}

impl From<StoreCapacity> for i64 {
    fn from(value: StoreCapacity) -> i64 {
        match value {
            StoreCapacity::Sized(size) => i64::try_from(size).unwrap_or(i64::MAX),
            StoreCapacity::Unlimited => -1,
        }
    }
}

/// Whether the queue gate is active.
///
/// When disabled, the caller bypasses queueing entirely; the core still
/// exposes the knob so all front-ends agree on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueEnabled(pub bool);

impl From<bool> for QueueEnabled {
    fn from(value: bool) -> Self {
        Self(value)
    }
}

impl From<QueueEnabled> for bool {
    fn from(value: QueueEnabled) -> Self {
        value.0
    }
}

impl From<QueueEnabled> for i64 {
    fn from(value: QueueEnabled) -> Self {
        i64::from(value.0)
    }
}

impl From<QueueEnabled> for String {
    fn from(value: QueueEnabled) -> Self {
        match value.0 {
            true => String::from("1"),
            false => String::from("0"),
        }
    }
}

impl TryFrom<i64> for QueueEnabled {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            1 => Ok(Self(true)),
            0 => Ok(Self(false)),
            _ => Err(Error::EnabledOutOfRange(value.to_string())),
        }
    }
}

impl TryFrom<&str> for QueueEnabled {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value.trim() {
            "1" => Ok(Self(true)),
            "0" => Ok(Self(false)),
            _ => Err(Error::EnabledOutOfRange(String::from(value))),
        }
    }
}

impl TryFrom<Option<String>> for QueueEnabled {
    type Error = Error;

    fn try_from(value: Option<String>) -> Result<Self> {
        match value {
            Some(v) => Self::try_from(v.as_str()),
            None => Ok(Self(false)),
        }
    }
}

/// Where a session currently sits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Admitted: the session holds a store slot and may be forwarded
    /// upstream.
    Store,
    /// Waiting at the given 1-based queue position.
    Queued(u64),
}

impl Placement {
    /// Builds a placement from a script's position reply (0 = store).
    #[must_use]
    pub fn from_position(position: u64) -> Self {
        match position {
            0 => Self::Store,
            n => Self::Queued(n),
        }
    }

    /// Returns whether the session is admitted to the store.
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Store)
    }

    /// Returns the wire position: 0 for the store, 1-based otherwise.
    #[must_use]
    pub fn position(&self) -> u64 {
        match self {
            Self::Store => 0,
            Self::Queued(n) => *n,
        }
    }
}

/// Outcome of a `position_or_add` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Admission {
    /// Whether the session was newly inserted by this call.
    pub added: bool,
    /// Where the session now sits.
    pub placement: Placement,
}

/// Point-in-time configuration of one waiting room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    /// Whether the queue gate is active.
    pub enabled: bool,
    /// Store capacity.
    pub capacity: StoreCapacity,
    /// When housekeeping last completed a cycle.
    pub updated: Option<DateTime<Utc>>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: StoreCapacity::Unlimited,
            updated: None,
        }
    }
}

/// Point-in-time state of one waiting room, read atomically.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueStatus {
    /// Whether the queue gate is active.
    pub enabled: bool,
    /// Store capacity.
    pub capacity: StoreCapacity,
    /// Number of sessions waiting in the queue.
    pub queue_size: u64,
    /// Number of admitted sessions.
    pub store_size: u64,
    /// When housekeeping last completed a cycle.
    pub updated: Option<DateTime<Utc>>,
}

/// Counts from one housekeeping sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Queue entries removed because their expiry passed.
    pub queue_expired: u64,
    /// Store entries removed because their expiry passed.
    pub store_expired: u64,
    /// Sessions promoted from the queue into freed store slots.
    pub promoted: u64,
}

impl SweepReport {
    /// Creates a report from raw sweep counts.
    #[must_use]
    pub fn new(queue_expired: u64, store_expired: u64, promoted: u64) -> Self {
        Self {
            queue_expired,
            store_expired,
            promoted,
        }
    }

    /// Returns whether the sweep changed anything observable.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.queue_expired > 0 || self.store_expired > 0 || self.promoted > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod store_capacity {
        use super::*;

        #[test]
        fn from_i64_below_range_errors() {
            match StoreCapacity::try_from(-2i64) {
                Err(Error::CapacityOutOfRange(v)) => assert_eq!(v, "-2"),
                other => panic!("expected capacity error, got {other:?}"),
            }
        }

        #[test]
        fn from_i64_negative_one_is_unlimited() {
            assert_eq!(
                StoreCapacity::try_from(-1i64).unwrap(),
                StoreCapacity::Unlimited
            );
        }

        #[test]
        fn from_i64_sized() {
            assert_eq!(
                StoreCapacity::try_from(40i64).unwrap(),
                StoreCapacity::Sized(40)
            );
        }

        #[test]
        fn from_str_unparseable_errors() {
            match StoreCapacity::try_from("lots") {
                Err(Error::CapacityOutOfRange(v)) => assert_eq!(v, "lots"),
                other => panic!("expected capacity error, got {other:?}"),
            }
        }

        #[test]
        fn from_missing_is_unlimited() {
            let raw: Option<String> = None;
            assert_eq!(
                StoreCapacity::try_from(raw).unwrap(),
                StoreCapacity::Unlimited
            );
        }

        #[test]
        fn round_trips_to_i64() {
            assert_eq!(i64::from(StoreCapacity::Unlimited), -1);
            assert_eq!(i64::from(StoreCapacity::Sized(7)), 7);
        }

        #[test]
        fn admits_respects_bounds() {
            assert!(StoreCapacity::Unlimited.admits(u64::MAX - 1));
            assert!(StoreCapacity::Sized(2).admits(1));
            assert!(!StoreCapacity::Sized(2).admits(2));
            assert!(!StoreCapacity::Sized(0).admits(0));
        }
    }

    mod queue_enabled {
        use super::*;

        #[test]
        fn integer_round_trip() {
            assert_eq!(i64::from(QueueEnabled(true)), 1);
            assert_eq!(i64::from(QueueEnabled(false)), 0);
            assert_eq!(QueueEnabled::try_from(1i64).unwrap(), QueueEnabled(true));
            assert_eq!(QueueEnabled::try_from(0i64).unwrap(), QueueEnabled(false));
        }

        #[test]
        fn out_of_range_errors() {
            assert!(matches!(
                QueueEnabled::try_from(2i64),
                Err(Error::EnabledOutOfRange(_))
            ));
            assert!(matches!(
                QueueEnabled::try_from("yes"),
                Err(Error::EnabledOutOfRange(_))
            ));
        }

        #[test]
        fn missing_means_disabled() {
            let raw: Option<String> = None;
            assert_eq!(QueueEnabled::try_from(raw).unwrap(), QueueEnabled(false));
        }

        #[test]
        fn string_round_trip() {
            assert_eq!(String::from(QueueEnabled(true)), "1");
            assert_eq!(QueueEnabled::try_from("0").unwrap(), QueueEnabled(false));
        }
    }

    mod placement {
        use super::*;

        #[test]
        fn zero_is_the_store() {
            assert_eq!(Placement::from_position(0), Placement::Store);
            assert!(Placement::Store.is_admitted());
            assert_eq!(Placement::Store.position(), 0);
        }

        #[test]
        fn positive_is_a_queue_position() {
            let p = Placement::from_position(3);
            assert_eq!(p, Placement::Queued(3));
            assert!(!p.is_admitted());
            assert_eq!(p.position(), 3);
        }
    }

    mod sweep_report {
        use super::*;

        #[test]
        fn default_has_no_changes() {
            assert!(!SweepReport::default().has_changes());
        }

        #[test]
        fn any_count_is_a_change() {
            assert!(SweepReport::new(1, 0, 0).has_changes());
            assert!(SweepReport::new(0, 1, 0).has_changes());
            assert!(SweepReport::new(0, 0, 1).has_changes());
        }
    }
}
