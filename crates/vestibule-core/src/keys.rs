//! Typed builders for the Redis key layout.
//!
//! All admission state for one waiting room lives under a string prefix;
//! multiple prefixes coexist in one Redis instance. Keys are
//! `{prefix}:{suffix}` with a fixed suffix set:
//!
//! | Key | Type | Contents |
//! |---|---|---|
//! | `:queue_ids` | LIST | waiting IDs, front = position 1 |
//! | `:queue_expiry_secs` | HASH | ID → epoch-seconds expiry |
//! | `:queue_position_cache` | HASH | ID → last-observed 1-based position |
//! | `:store_ids` | SET | admitted IDs |
//! | `:store_expiry_secs` | HASH | ID → epoch-seconds expiry |
//! | `:store_capacity` | STRING | integer; negative = unbounded |
//! | `:queue_enabled` | STRING | `0` / `1` |
//! | `:queue_sync_timestamp` | STRING | epoch-seconds of last sweep |
//! | `:queue_waiting_page` | STRING | opaque HTML blob |
//! | `:events` | pub/sub | change-notification channel |
//! | `:sweep_lease` | STRING | advisory housekeeper lease (SET NX PX) |
//!
//! Routing every key through [`KeyPrefix`] keeps the layout in one place and
//! out of format strings scattered across the data plane.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The key prefix under which one waiting room's state lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPrefix(String);

impl KeyPrefix {
    /// Creates a prefix from the given string.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    /// Returns the raw prefix string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the FIFO list of waiting session IDs.
    #[must_use]
    pub fn queue_ids(&self) -> String {
        format!("{}:queue_ids", self.0)
    }

    /// Key of the queue ID → expiry hash.
    #[must_use]
    pub fn queue_expiry_secs(&self) -> String {
        format!("{}:queue_expiry_secs", self.0)
    }

    /// Key of the queue ID → cached-position hash.
    #[must_use]
    pub fn queue_position_cache(&self) -> String {
        format!("{}:queue_position_cache", self.0)
    }

    /// Key of the set of admitted session IDs.
    #[must_use]
    pub fn store_ids(&self) -> String {
        format!("{}:store_ids", self.0)
    }

    /// Key of the store ID → expiry hash.
    #[must_use]
    pub fn store_expiry_secs(&self) -> String {
        format!("{}:store_expiry_secs", self.0)
    }

    /// Key of the store-capacity control value.
    #[must_use]
    pub fn store_capacity(&self) -> String {
        format!("{}:store_capacity", self.0)
    }

    /// Key of the queue-enabled control value.
    #[must_use]
    pub fn queue_enabled(&self) -> String {
        format!("{}:queue_enabled", self.0)
    }

    /// Key of the last-sweep timestamp.
    #[must_use]
    pub fn queue_sync_timestamp(&self) -> String {
        format!("{}:queue_sync_timestamp", self.0)
    }

    /// Key of the waiting-page blob.
    #[must_use]
    pub fn queue_waiting_page(&self) -> String {
        format!("{}:queue_waiting_page", self.0)
    }

    /// Name of the pub/sub channel carrying change events.
    #[must_use]
    pub fn events_channel(&self) -> String {
        format!("{}:events", self.0)
    }

    /// Key of the advisory housekeeper lease.
    #[must_use]
    pub fn sweep_lease(&self) -> String {
        format!("{}:sweep_lease", self.0)
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for KeyPrefix {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for KeyPrefix {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for KeyPrefix {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
