//! The recognized configuration surface.
//!
//! Every option has a default; an empty config file (or none at all) yields a
//! working single-instance deployment against a local Redis. Durations are
//! configured in whole seconds, matching the second-granularity expiry model
//! of the data plane.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::keys::KeyPrefix;
use crate::settings::StoreCapacity;

fn default_redis_url() -> String {
    String::from("redis://127.0.0.1:6379")
}

fn default_redis_prefix() -> String {
    String::from("vestibule")
}

fn default_store_capacity() -> i64 {
    -1
}

fn default_queue_enabled() -> bool {
    true
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_validated_expiry_secs() -> u64 {
    600
}

fn default_quarantine_expiry_secs() -> u64 {
    45
}

fn default_publish_throttle_secs() -> u64 {
    0
}

fn default_sweep_interval_secs() -> u64 {
    1
}

/// Configuration for one Vestibule process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VestibuleConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Key prefix under which this deployment's state lives.
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,

    /// Store capacity seeded when the backing store is uninitialized.
    /// Negative means unbounded, zero means closed.
    #[serde(default = "default_store_capacity")]
    pub store_capacity: i64,

    /// Queue-enabled flag seeded when the backing store is uninitialized.
    #[serde(default = "default_queue_enabled")]
    pub queue_enabled: bool,

    /// How long to wait for a pooled connection.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// How long to wait for a new connection to be established.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// TTL granted to a session confirmed in the queue or store.
    #[serde(default = "default_validated_expiry_secs")]
    pub validated_expiry_secs: u64,

    /// Short TTL granted to a newly inserted, not-yet-revalidated session.
    #[serde(default = "default_quarantine_expiry_secs")]
    pub quarantine_expiry_secs: u64,

    /// Minimum interval between published events of the same kind.
    /// Zero disables coalescing.
    #[serde(default = "default_publish_throttle_secs")]
    pub publish_throttle_secs: u64,

    /// Period of the housekeeping sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for VestibuleConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            redis_prefix: default_redis_prefix(),
            store_capacity: default_store_capacity(),
            queue_enabled: default_queue_enabled(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            validated_expiry_secs: default_validated_expiry_secs(),
            quarantine_expiry_secs: default_quarantine_expiry_secs(),
            publish_throttle_secs: default_publish_throttle_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl VestibuleConfig {
    /// Returns the configured key prefix.
    #[must_use]
    pub fn prefix(&self) -> KeyPrefix {
        KeyPrefix::new(self.redis_prefix.clone())
    }

    /// Returns the seed store capacity.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::CapacityOutOfRange`] when the configured value
    /// is below -1.
    pub fn capacity(&self) -> crate::Result<StoreCapacity> {
        StoreCapacity::try_from(self.store_capacity)
    }

    /// Pool-acquire timeout.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Connection-establishment timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// TTL for validated sessions.
    #[must_use]
    pub fn validated_expiry(&self) -> Duration {
        Duration::from_secs(self.validated_expiry_secs)
    }

    /// TTL for quarantined sessions.
    #[must_use]
    pub fn quarantine_expiry(&self) -> Duration {
        Duration::from_secs(self.quarantine_expiry_secs)
    }

    /// Event-coalescing window.
    #[must_use]
    pub fn publish_throttle(&self) -> Duration {
        Duration::from_secs(self.publish_throttle_secs)
    }

    /// Housekeeping period.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
