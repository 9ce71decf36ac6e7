//! The admission backend abstraction.
//!
//! All truth lives in the backing store; front-ends are stateless. The
//! backend surface is split by capability so callers depend only on what
//! they use:
//!
//! | Trait | Operations | Who uses it |
//! |-------|------------|-------------|
//! | [`AtomicOps`] | the atomic state scripts + combined sweep | admission client, housekeeper |
//! | [`SettingsOps`] | control-value reads/writes, status snapshot | admission client, status UI |
//! | [`EventOps`] | publish/subscribe on the events channel | admission client |
//! | [`LeaseOps`] | advisory sweep lease | housekeeper |
//! | [`ClockOps`] | backing-store clock | admission client |
//!
//! [`AdmissionBackend`] is the sum of the capabilities. Two implementations
//! exist: [`RedisBackend`] for production and [`MemoryBackend`], a
//! single-process twin with identical semantics for tests and local
//! development.
//!
//! Every mutating operation takes a caller-supplied `now` in epoch seconds,
//! so a request is timestamped exactly once no matter how many scripts it
//! touches, and tests are deterministic.

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use vestibule_core::error::Result;
use vestibule_core::{KeyPrefix, SessionId, SweepReport};

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// A shared handle to any admission backend.
pub type SharedBackend = Arc<dyn AdmissionBackend>;

/// Raw, atomically-read state of one waiting room.
///
/// Control values are carried as the wire strings Redis holds; parsing into
/// typed values (and the defined meanings of missing keys) happens in the
/// admission client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStatus {
    /// Raw queue-enabled value, if set.
    pub enabled: Option<String>,
    /// Raw store-capacity value, if set.
    pub capacity: Option<String>,
    /// Number of admitted sessions.
    pub store_size: u64,
    /// Number of queued sessions.
    pub queue_size: u64,
    /// Last sweep timestamp in epoch seconds, if set.
    pub sync_timestamp: Option<i64>,
}

/// The atomic state scripts.
///
/// Each operation executes as one indivisible unit against the backing
/// store; no interleaving is observable. Contracts follow the script files
/// under `redis_functions/`.
#[async_trait]
pub trait AtomicOps: Send + Sync {
    /// Places `id` into the store or queue if absent; refreshes its expiry
    /// otherwise. Returns the position (0 = store).
    async fn id_add(
        &self,
        prefix: &KeyPrefix,
        id: &SessionId,
        now: i64,
        validated_expiry: Duration,
        quarantine_expiry: Duration,
    ) -> Result<u64>;

    /// The hot path: returns whether `id` was newly added and its position
    /// (0 = store), refreshing the expiry of a live ID as a side effect.
    async fn id_position(
        &self,
        prefix: &KeyPrefix,
        id: &SessionId,
        now: i64,
        validated_expiry: Duration,
        quarantine_expiry: Duration,
    ) -> Result<(bool, u64)>;

    /// Removes `id`: eagerly from the store, or by antedating its queue
    /// expiry so the next queue sweep drops it.
    async fn id_remove(&self, prefix: &KeyPrefix, id: &SessionId, now: i64) -> Result<()>;

    /// Moves `id` into the store unconditionally, ignoring capacity.
    async fn id_promote(
        &self,
        prefix: &KeyPrefix,
        id: &SessionId,
        now: i64,
        validated_expiry: Duration,
    ) -> Result<()>;

    /// Fills free store capacity from the queue front. Returns the number of
    /// sessions moved.
    async fn store_promote(&self, prefix: &KeyPrefix) -> Result<u64>;

    /// Moves up to `n` sessions from the queue front into the store,
    /// ignoring capacity. Returns the number moved.
    async fn store_promote_n(&self, prefix: &KeyPrefix, n: u64) -> Result<u64>;

    /// Drops expired queue entries and recompacts the position cache.
    /// Returns the number removed. O(queue); housekeeping only.
    async fn queue_timeout(&self, prefix: &KeyPrefix, now: i64) -> Result<u64>;

    /// Drops expired store entries. Returns the number removed.
    async fn store_timeout(&self, prefix: &KeyPrefix, now: i64) -> Result<u64>;

    /// Reports whether any session IDs exist under the prefix. An unseeded
    /// prefix reports `true` so the caller re-initializes.
    async fn has_ids(&self, prefix: &KeyPrefix) -> Result<bool>;

    /// Reports whether the control keys required for synchronization exist.
    async fn check_sync_keys(&self, prefix: &KeyPrefix) -> Result<bool>;

    /// One housekeeping cycle as a single atomic unit: queue sweep, store
    /// sweep, promotion, sync-timestamp write.
    async fn sweep(&self, prefix: &KeyPrefix, now: i64) -> Result<SweepReport>;
}

/// Control-value reads and writes.
#[async_trait]
pub trait SettingsOps: Send + Sync {
    /// Reads the raw queue-enabled value.
    async fn queue_enabled_raw(&self, prefix: &KeyPrefix) -> Result<Option<String>>;

    /// Reads the raw store-capacity value.
    async fn store_capacity_raw(&self, prefix: &KeyPrefix) -> Result<Option<String>>;

    /// Current queue length.
    async fn queue_size(&self, prefix: &KeyPrefix) -> Result<u64>;

    /// Current store size.
    async fn store_size(&self, prefix: &KeyPrefix) -> Result<u64>;

    /// Reads the waiting-page blob.
    async fn waiting_page(&self, prefix: &KeyPrefix) -> Result<Option<String>>;

    /// Replaces the waiting-page blob.
    async fn set_waiting_page(&self, prefix: &KeyPrefix, body: &str) -> Result<()>;

    /// Reads enabled, capacity, sizes, and sync timestamp as one atomic
    /// snapshot.
    async fn status(&self, prefix: &KeyPrefix) -> Result<RawStatus>;

    /// Writes the given control values and stamps the sync timestamp, all
    /// atomically. `None` leaves a value untouched.
    async fn write_settings(
        &self,
        prefix: &KeyPrefix,
        enabled: Option<&str>,
        capacity: Option<&str>,
        sync_timestamp: i64,
    ) -> Result<()>;
}

/// Publish/subscribe on the per-prefix events channel.
///
/// Delivery is best-effort in both directions: publishing to nobody is not
/// an error, and slow subscribers may observe lag.
#[async_trait]
pub trait EventOps: Send + Sync {
    /// Publishes a short event string on the prefix's events channel.
    async fn publish(&self, prefix: &KeyPrefix, payload: &str) -> Result<()>;

    /// Subscribes to the prefix's events channel.
    async fn subscribe(&self, prefix: &KeyPrefix) -> Result<broadcast::Receiver<String>>;
}

/// Advisory lease gating the housekeeper to one worker at a time.
#[async_trait]
pub trait LeaseOps: Send + Sync {
    /// Attempts to take (or renew, for the same holder) the sweep lease.
    /// Returns whether the caller holds it for the next `ttl`.
    async fn try_lease(&self, prefix: &KeyPrefix, holder: &str, ttl: Duration) -> Result<bool>;
}

/// The backing store's clock.
#[async_trait]
pub trait ClockOps: Send + Sync {
    /// Current time according to the backing store — the one clock authority
    /// shared by every front-end.
    async fn current_time(&self) -> Result<DateTime<Utc>>;
}

/// The full admission backend: every capability the core needs.
pub trait AdmissionBackend:
    AtomicOps + SettingsOps + EventOps + LeaseOps + ClockOps + 'static
{
}

impl<T> AdmissionBackend for T where
    T: AtomicOps + SettingsOps + EventOps + LeaseOps + ClockOps + 'static
{
}
