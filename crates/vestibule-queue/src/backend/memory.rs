//! In-memory admission backend.
//!
//! A single-process twin of [`RedisBackend`](super::RedisBackend) with
//! identical semantics, for tests and local development. One mutex guards
//! all per-prefix state, so every operation is as atomic as a server-side
//! script; events ride a broadcast channel per prefix.
//!
//! Not suitable for production: state is process-local and lost on exit,
//! which defeats the point of a shared waiting room.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use vestibule_core::error::{Error, Result};
use vestibule_core::{KeyPrefix, SessionId, SweepReport};

use super::{AtomicOps, ClockOps, EventOps, LeaseOps, RawStatus, SettingsOps};

/// Capacity of each per-prefix event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// All keys of one waiting room.
#[derive(Debug, Default)]
struct PrefixState {
    queue_ids: VecDeque<String>,
    queue_expiry: HashMap<String, i64>,
    position_cache: HashMap<String, u64>,
    store_ids: HashSet<String>,
    store_expiry: HashMap<String, i64>,
    capacity: Option<String>,
    enabled: Option<String>,
    sync_timestamp: Option<i64>,
    waiting_page: Option<String>,
}

impl PrefixState {
    /// Capacity with the script-side fallback: missing or unparseable
    /// values mean unbounded.
    fn capacity_or_unbounded(&self) -> i64 {
        self.capacity
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(-1)
    }

    /// First-sighting placement into the store or the back of the queue.
    /// Returns the position (0 = store).
    fn place_new(
        &mut self,
        id: &str,
        now: i64,
        validated_secs: i64,
        quarantine_secs: i64,
    ) -> u64 {
        let capacity = self.capacity_or_unbounded();

        if capacity < 0 {
            self.store_ids.insert(id.to_string());
            self.store_expiry.insert(id.to_string(), now + validated_secs);
            return 0;
        }

        let store_size = i64::try_from(self.store_ids.len()).unwrap_or(i64::MAX);
        if !self.queue_ids.is_empty() || store_size >= capacity {
            self.queue_ids.push_back(id.to_string());
            let position = self.queue_ids.len() as u64;
            self.position_cache.insert(id.to_string(), position);
            self.queue_expiry.insert(id.to_string(), now + quarantine_secs);
            return position;
        }

        self.store_ids.insert(id.to_string());
        self.store_expiry.insert(id.to_string(), now + validated_secs);
        0
    }

    /// `id_position` semantics; returns (added, position).
    fn touch_or_place(
        &mut self,
        id: &str,
        now: i64,
        validated_secs: i64,
        quarantine_secs: i64,
    ) -> (bool, u64) {
        if self.store_ids.contains(id) {
            self.store_expiry.insert(id.to_string(), now + validated_secs);
            return (false, 0);
        }

        if let Some(position) = self.position_cache.get(id).copied() {
            self.queue_expiry.insert(id.to_string(), now + validated_secs);
            return (false, position);
        }

        (true, self.place_new(id, now, validated_secs, quarantine_secs))
    }

    fn remove(&mut self, id: &str, now: i64) {
        if self.queue_expiry.contains_key(id) {
            self.queue_expiry.insert(id.to_string(), now - 1);
            return;
        }

        self.store_ids.remove(id);
        self.store_expiry.remove(id);
    }

    fn promote_id(&mut self, id: &str, now: i64, validated_secs: i64) {
        if let Some(index) = self.queue_ids.iter().position(|queued| queued == id) {
            self.queue_ids.remove(index);
        }
        self.position_cache.remove(id);
        self.queue_expiry.remove(id);
        self.store_ids.insert(id.to_string());
        self.store_expiry.insert(id.to_string(), now + validated_secs);
    }

    /// Pops up to `transfer` IDs from the queue front into the store,
    /// carrying each expiry as-is.
    fn promote_front(&mut self, transfer: i64) -> u64 {
        let mut moved = 0u64;
        while i64::try_from(moved).unwrap_or(i64::MAX) < transfer {
            let Some(id) = self.queue_ids.pop_front() else {
                break;
            };

            self.position_cache.remove(&id);
            let expiry = self.queue_expiry.remove(&id).unwrap_or(0);
            self.store_expiry.insert(id.clone(), expiry);
            self.store_ids.insert(id);

            moved += 1;
        }
        moved
    }

    fn promote_up_to_capacity(&mut self) -> u64 {
        let capacity = self.capacity_or_unbounded();

        let transfer = if capacity < 0 {
            i64::try_from(self.queue_ids.len()).unwrap_or(i64::MAX)
        } else if capacity > 0 {
            capacity - i64::try_from(self.store_ids.len()).unwrap_or(i64::MAX)
        } else {
            0
        };

        self.promote_front(transfer)
    }

    fn expire_queue(&mut self, now: i64) -> u64 {
        let snapshot: Vec<String> = self.queue_ids.iter().cloned().collect();

        let mut removed = 0u64;
        for (index, id) in snapshot.iter().enumerate() {
            let expiry = self.queue_expiry.get(id).copied();
            // Strict comparison: an entry expiring exactly now is still live
            if expiry.is_none() || expiry.is_some_and(|e| e < now) {
                if let Some(found) = self.queue_ids.iter().position(|queued| queued == id) {
                    self.queue_ids.remove(found);
                }
                self.queue_expiry.remove(id);
                self.position_cache.remove(id);
                removed += 1;
            } else {
                let position = index as u64 + 1 - removed;
                self.position_cache.insert(id.clone(), position);
            }
        }

        removed
    }

    fn expire_store(&mut self, now: i64) -> u64 {
        let snapshot: Vec<String> = self.store_ids.iter().cloned().collect();

        let mut removed = 0u64;
        for id in snapshot {
            let expiry = self.store_expiry.get(&id).copied();
            if expiry.is_none() || expiry.is_some_and(|e| e < now) {
                self.store_ids.remove(&id);
                self.store_expiry.remove(&id);
                removed += 1;
            }
        }

        removed
    }
}

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

/// In-memory admission backend for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<HashMap<String, PrefixState>>,
    events: Mutex<HashMap<String, broadcast::Sender<String>>>,
    leases: Mutex<HashMap<String, Lease>>,
}

/// Converts a lock poison error to a transport error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transport("state lock poisoned")
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every key under every prefix, as a Redis `FLUSHDB` would.
    /// Event subscriptions survive, matching pub/sub behavior.
    pub fn flush(&self) -> Result<()> {
        self.state.lock().map_err(poison_err)?.clear();
        self.leases.lock().map_err(poison_err)?.clear();
        Ok(())
    }

    /// Runs `f` over the prefix state, creating it if absent.
    fn with_state<R>(&self, prefix: &KeyPrefix, f: impl FnOnce(&mut PrefixState) -> R) -> Result<R> {
        let mut state = self.state.lock().map_err(poison_err)?;
        Ok(f(state.entry(prefix.as_str().to_string()).or_default()))
    }

    /// Runs `f` over the prefix state if it exists.
    fn read_state<R>(
        &self,
        prefix: &KeyPrefix,
        f: impl FnOnce(Option<&PrefixState>) -> R,
    ) -> Result<R> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(f(state.get(prefix.as_str())))
    }

    /// Current queue contents, front first. Inspection helper for tests and
    /// diagnostics.
    pub fn queue_snapshot(&self, prefix: &KeyPrefix) -> Result<Vec<String>> {
        self.read_state(prefix, |state| {
            state
                .map(|s| s.queue_ids.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Current store members, unordered. Inspection helper.
    pub fn store_snapshot(&self, prefix: &KeyPrefix) -> Result<Vec<String>> {
        self.read_state(prefix, |state| {
            state
                .map(|s| s.store_ids.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Cached queue position of an ID. Inspection helper.
    pub fn cached_position(&self, prefix: &KeyPrefix, id: &SessionId) -> Result<Option<u64>> {
        let id = id.to_string();
        self.read_state(prefix, |state| {
            state.and_then(|s| s.position_cache.get(&id).copied())
        })
    }

    /// Queue expiry of an ID in epoch seconds. Inspection helper.
    pub fn queue_expiry_of(&self, prefix: &KeyPrefix, id: &SessionId) -> Result<Option<i64>> {
        let id = id.to_string();
        self.read_state(prefix, |state| {
            state.and_then(|s| s.queue_expiry.get(&id).copied())
        })
    }

    /// Store expiry of an ID in epoch seconds. Inspection helper.
    pub fn store_expiry_of(&self, prefix: &KeyPrefix, id: &SessionId) -> Result<Option<i64>> {
        let id = id.to_string();
        self.read_state(prefix, |state| {
            state.and_then(|s| s.store_expiry.get(&id).copied())
        })
    }

    fn sender_for(&self, prefix: &KeyPrefix) -> Result<broadcast::Sender<String>> {
        let mut events = self.events.lock().map_err(poison_err)?;
        Ok(events
            .entry(prefix.as_str().to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone())
    }
}

#[allow(clippy::cast_possible_wrap)]
fn secs(duration: Duration) -> i64 {
    duration.as_secs() as i64
}

#[async_trait]
impl AtomicOps for MemoryBackend {
    async fn id_add(
        &self,
        prefix: &KeyPrefix,
        id: &SessionId,
        now: i64,
        validated_expiry: Duration,
        quarantine_expiry: Duration,
    ) -> Result<u64> {
        let id = id.to_string();
        self.with_state(prefix, |state| {
            let (_, position) =
                state.touch_or_place(&id, now, secs(validated_expiry), secs(quarantine_expiry));
            position
        })
    }

    async fn id_position(
        &self,
        prefix: &KeyPrefix,
        id: &SessionId,
        now: i64,
        validated_expiry: Duration,
        quarantine_expiry: Duration,
    ) -> Result<(bool, u64)> {
        let id = id.to_string();
        self.with_state(prefix, |state| {
            state.touch_or_place(&id, now, secs(validated_expiry), secs(quarantine_expiry))
        })
    }

    async fn id_remove(&self, prefix: &KeyPrefix, id: &SessionId, now: i64) -> Result<()> {
        let id = id.to_string();
        self.with_state(prefix, |state| state.remove(&id, now))
    }

    async fn id_promote(
        &self,
        prefix: &KeyPrefix,
        id: &SessionId,
        now: i64,
        validated_expiry: Duration,
    ) -> Result<()> {
        let id = id.to_string();
        self.with_state(prefix, |state| {
            state.promote_id(&id, now, secs(validated_expiry));
        })
    }

    async fn store_promote(&self, prefix: &KeyPrefix) -> Result<u64> {
        self.with_state(prefix, PrefixState::promote_up_to_capacity)
    }

    async fn store_promote_n(&self, prefix: &KeyPrefix, n: u64) -> Result<u64> {
        self.with_state(prefix, |state| {
            state.promote_front(i64::try_from(n).unwrap_or(i64::MAX))
        })
    }

    async fn queue_timeout(&self, prefix: &KeyPrefix, now: i64) -> Result<u64> {
        self.with_state(prefix, |state| state.expire_queue(now))
    }

    async fn store_timeout(&self, prefix: &KeyPrefix, now: i64) -> Result<u64> {
        self.with_state(prefix, |state| state.expire_store(now))
    }

    async fn has_ids(&self, prefix: &KeyPrefix) -> Result<bool> {
        self.read_state(prefix, |state| match state {
            // Unseeded prefix: report non-empty so the caller re-initializes
            None => true,
            Some(s) => {
                s.sync_timestamp.is_none()
                    || !s.queue_ids.is_empty()
                    || !s.store_ids.is_empty()
            }
        })
    }

    async fn check_sync_keys(&self, prefix: &KeyPrefix) -> Result<bool> {
        self.read_state(prefix, |state| {
            state.is_some_and(|s| {
                s.enabled.is_some() && s.capacity.is_some() && s.sync_timestamp.is_some()
            })
        })
    }

    async fn sweep(&self, prefix: &KeyPrefix, now: i64) -> Result<SweepReport> {
        self.with_state(prefix, |state| {
            let queue_expired = state.expire_queue(now);
            let store_expired = state.expire_store(now);
            let promoted = state.promote_up_to_capacity();
            state.sync_timestamp = Some(now);
            SweepReport::new(queue_expired, store_expired, promoted)
        })
    }
}

#[async_trait]
impl SettingsOps for MemoryBackend {
    async fn queue_enabled_raw(&self, prefix: &KeyPrefix) -> Result<Option<String>> {
        self.read_state(prefix, |state| state.and_then(|s| s.enabled.clone()))
    }

    async fn store_capacity_raw(&self, prefix: &KeyPrefix) -> Result<Option<String>> {
        self.read_state(prefix, |state| state.and_then(|s| s.capacity.clone()))
    }

    async fn queue_size(&self, prefix: &KeyPrefix) -> Result<u64> {
        self.read_state(prefix, |state| {
            state.map(|s| s.queue_ids.len() as u64).unwrap_or(0)
        })
    }

    async fn store_size(&self, prefix: &KeyPrefix) -> Result<u64> {
        self.read_state(prefix, |state| {
            state.map(|s| s.store_ids.len() as u64).unwrap_or(0)
        })
    }

    async fn waiting_page(&self, prefix: &KeyPrefix) -> Result<Option<String>> {
        self.read_state(prefix, |state| state.and_then(|s| s.waiting_page.clone()))
    }

    async fn set_waiting_page(&self, prefix: &KeyPrefix, body: &str) -> Result<()> {
        let body = body.to_string();
        self.with_state(prefix, |state| {
            state.waiting_page = Some(body);
        })
    }

    async fn status(&self, prefix: &KeyPrefix) -> Result<RawStatus> {
        self.read_state(prefix, |state| {
            state
                .map(|s| RawStatus {
                    enabled: s.enabled.clone(),
                    capacity: s.capacity.clone(),
                    store_size: s.store_ids.len() as u64,
                    queue_size: s.queue_ids.len() as u64,
                    sync_timestamp: s.sync_timestamp,
                })
                .unwrap_or_default()
        })
    }

    async fn write_settings(
        &self,
        prefix: &KeyPrefix,
        enabled: Option<&str>,
        capacity: Option<&str>,
        sync_timestamp: i64,
    ) -> Result<()> {
        self.with_state(prefix, |state| {
            if let Some(enabled) = enabled {
                state.enabled = Some(enabled.to_string());
            }
            if let Some(capacity) = capacity {
                state.capacity = Some(capacity.to_string());
            }
            state.sync_timestamp = Some(sync_timestamp);
        })
    }
}

#[async_trait]
impl EventOps for MemoryBackend {
    async fn publish(&self, prefix: &KeyPrefix, payload: &str) -> Result<()> {
        let sender = self.sender_for(prefix)?;
        // Nobody listening is fine; delivery is best-effort
        let _ = sender.send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, prefix: &KeyPrefix) -> Result<broadcast::Receiver<String>> {
        Ok(self.sender_for(prefix)?.subscribe())
    }
}

#[async_trait]
impl LeaseOps for MemoryBackend {
    async fn try_lease(&self, prefix: &KeyPrefix, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().map_err(poison_err)?;
        let now = Instant::now();

        if let Some(lease) = leases.get(prefix.as_str()) {
            if lease.expires_at > now && lease.holder != holder {
                return Ok(false);
            }
        }

        leases.insert(
            prefix.as_str().to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }
}

#[async_trait]
impl ClockOps for MemoryBackend {
    async fn current_time(&self) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALIDATED: Duration = Duration::from_secs(600);
    const QUARANTINE: Duration = Duration::from_secs(45);
    const NOW: i64 = 1000;

    fn prefix(name: &str) -> KeyPrefix {
        KeyPrefix::new(name)
    }

    async fn set_capacity(backend: &MemoryBackend, prefix: &KeyPrefix, capacity: i64) {
        backend
            .write_settings(prefix, Some("1"), Some(&capacity.to_string()), NOW)
            .await
            .expect("write settings");
    }

    #[tokio::test]
    async fn unbounded_capacity_admits_everyone() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_unbounded");
        set_capacity(&backend, &p, -1).await;

        for _ in 0..10 {
            let id = SessionId::generate();
            let position = backend
                .id_add(&p, &id, NOW, VALIDATED, QUARANTINE)
                .await
                .expect("id_add");
            assert_eq!(position, 0);
        }
        assert_eq!(backend.store_size(&p).await.unwrap(), 10);
        assert_eq!(backend.queue_size(&p).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_capacity_means_unbounded() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_missing_capacity");

        let id = SessionId::generate();
        let position = backend
            .id_add(&p, &id, NOW, VALIDATED, QUARANTINE)
            .await
            .expect("id_add");
        assert_eq!(position, 0);
    }

    #[tokio::test]
    async fn unparseable_capacity_means_unbounded() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_bad_capacity");
        backend
            .write_settings(&p, Some("1"), Some("banana"), NOW)
            .await
            .expect("write settings");

        let id = SessionId::generate();
        let position = backend
            .id_add(&p, &id, NOW, VALIDATED, QUARANTINE)
            .await
            .expect("id_add");
        assert_eq!(position, 0);
    }

    #[tokio::test]
    async fn zero_capacity_queues_everyone() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_zero_capacity");
        set_capacity(&backend, &p, 0).await;

        for expected in 1..=4u64 {
            let id = SessionId::generate();
            let position = backend
                .id_add(&p, &id, NOW, VALIDATED, QUARANTINE)
                .await
                .expect("id_add");
            assert_eq!(position, expected);
        }
        assert_eq!(backend.store_promote(&p).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn overflow_spills_into_the_queue_in_order() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_overflow");
        set_capacity(&backend, &p, 2).await;

        let a = SessionId::generate();
        let b = SessionId::generate();
        let c = SessionId::generate();
        let d = SessionId::generate();

        assert_eq!(backend.id_add(&p, &a, NOW, VALIDATED, QUARANTINE).await.unwrap(), 0);
        assert_eq!(backend.id_add(&p, &b, NOW, VALIDATED, QUARANTINE).await.unwrap(), 0);
        assert_eq!(backend.id_add(&p, &c, NOW, VALIDATED, QUARANTINE).await.unwrap(), 1);
        assert_eq!(backend.id_add(&p, &d, NOW, VALIDATED, QUARANTINE).await.unwrap(), 2);

        assert_eq!(
            backend.queue_snapshot(&p).unwrap(),
            vec![c.to_string(), d.to_string()]
        );
    }

    #[tokio::test]
    async fn touch_refreshes_instead_of_reinserting() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_touch");
        set_capacity(&backend, &p, 0).await;

        let id = SessionId::generate();
        let (added, position) = backend
            .id_position(&p, &id, NOW, VALIDATED, QUARANTINE)
            .await
            .expect("first");
        assert!(added);
        assert_eq!(position, 1);
        assert_eq!(
            backend.queue_expiry_of(&p, &id).unwrap(),
            Some(NOW + 45)
        );

        // Second touch: same position, expiry upgraded to validated
        let (added, position) = backend
            .id_position(&p, &id, NOW, VALIDATED, QUARANTINE)
            .await
            .expect("second");
        assert!(!added);
        assert_eq!(position, 1);
        assert_eq!(
            backend.queue_expiry_of(&p, &id).unwrap(),
            Some(NOW + 600)
        );
        assert_eq!(backend.queue_size(&p).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn store_removal_is_eager_queue_removal_is_lazy() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_remove");
        set_capacity(&backend, &p, 1).await;

        let stored = SessionId::generate();
        let queued = SessionId::generate();
        backend.id_add(&p, &stored, NOW, VALIDATED, QUARANTINE).await.unwrap();
        backend.id_add(&p, &queued, NOW, VALIDATED, QUARANTINE).await.unwrap();

        backend.id_remove(&p, &stored, NOW).await.unwrap();
        assert_eq!(backend.store_size(&p).await.unwrap(), 0);
        assert_eq!(backend.store_expiry_of(&p, &stored).unwrap(), None);

        backend.id_remove(&p, &queued, NOW).await.unwrap();
        // Still listed until the next sweep, but antedated
        assert_eq!(backend.queue_size(&p).await.unwrap(), 1);
        assert_eq!(backend.queue_expiry_of(&p, &queued).unwrap(), Some(NOW - 1));

        assert_eq!(backend.queue_timeout(&p, NOW).await.unwrap(), 1);
        assert_eq!(backend.queue_size(&p).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_twice_is_safe() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_remove_twice");
        set_capacity(&backend, &p, 1).await;

        let id = SessionId::generate();
        backend.id_add(&p, &id, NOW, VALIDATED, QUARANTINE).await.unwrap();
        backend.id_remove(&p, &id, NOW).await.unwrap();
        backend.id_remove(&p, &id, NOW).await.unwrap();
        assert_eq!(backend.store_size(&p).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn promote_ignores_capacity_and_is_idempotent() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_id_promote");
        set_capacity(&backend, &p, 0).await;

        let x = SessionId::generate();
        let y = SessionId::generate();
        backend.id_add(&p, &x, NOW, VALIDATED, QUARANTINE).await.unwrap();
        backend.id_add(&p, &y, NOW, VALIDATED, QUARANTINE).await.unwrap();

        backend.id_promote(&p, &y, NOW, VALIDATED).await.unwrap();
        backend.id_promote(&p, &y, NOW, VALIDATED).await.unwrap();

        assert_eq!(backend.store_snapshot(&p).unwrap(), vec![y.to_string()]);
        assert_eq!(backend.queue_snapshot(&p).unwrap(), vec![x.to_string()]);
        assert_eq!(backend.store_expiry_of(&p, &y).unwrap(), Some(NOW + 600));
        assert_eq!(backend.cached_position(&p, &y).unwrap(), None);
    }

    #[tokio::test]
    async fn store_promote_carries_queue_expiry() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_promote_expiry");
        set_capacity(&backend, &p, 0).await;

        let id = SessionId::generate();
        backend.id_add(&p, &id, NOW, VALIDATED, QUARANTINE).await.unwrap();

        set_capacity(&backend, &p, 5).await;
        assert_eq!(backend.store_promote(&p).await.unwrap(), 1);

        // The quarantine expiry rides along unchanged
        assert_eq!(backend.store_expiry_of(&p, &id).unwrap(), Some(NOW + 45));
        assert_eq!(backend.queue_expiry_of(&p, &id).unwrap(), None);
    }

    #[tokio::test]
    async fn store_promote_unbounded_drains_the_queue() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_promote_drain");
        set_capacity(&backend, &p, 0).await;

        for _ in 0..5 {
            let id = SessionId::generate();
            backend.id_add(&p, &id, NOW, VALIDATED, QUARANTINE).await.unwrap();
        }

        set_capacity(&backend, &p, -1).await;
        assert_eq!(backend.store_promote(&p).await.unwrap(), 5);
        assert_eq!(backend.queue_size(&p).await.unwrap(), 0);
        assert_eq!(backend.store_size(&p).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn store_promote_n_ignores_capacity_and_short_circuits() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_promote_n");
        set_capacity(&backend, &p, 0).await;

        for _ in 0..3 {
            let id = SessionId::generate();
            backend.id_add(&p, &id, NOW, VALIDATED, QUARANTINE).await.unwrap();
        }

        assert_eq!(backend.store_promote_n(&p, 10).await.unwrap(), 3);
        assert_eq!(backend.store_size(&p).await.unwrap(), 3);
        assert_eq!(backend.store_promote_n(&p, 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queue_timeout_compacts_the_position_cache() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_queue_timeout");
        set_capacity(&backend, &p, 0).await;

        let a = SessionId::generate();
        let b = SessionId::generate();
        let c = SessionId::generate();
        backend.id_add(&p, &a, NOW, VALIDATED, QUARANTINE).await.unwrap();
        backend.id_add(&p, &b, NOW, VALIDATED, QUARANTINE).await.unwrap();
        backend.id_add(&p, &c, NOW, VALIDATED, QUARANTINE).await.unwrap();

        // Expire a and c, keep b alive
        backend.id_remove(&p, &a, NOW).await.unwrap();
        backend.id_remove(&p, &c, NOW).await.unwrap();

        assert_eq!(backend.queue_timeout(&p, NOW).await.unwrap(), 2);
        assert_eq!(backend.queue_snapshot(&p).unwrap(), vec![b.to_string()]);
        assert_eq!(backend.cached_position(&p, &b).unwrap(), Some(1));
    }

    #[tokio::test]
    async fn expiry_boundary_is_strict() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_boundary");
        set_capacity(&backend, &p, 0).await;

        let id = SessionId::generate();
        backend.id_add(&p, &id, NOW, VALIDATED, QUARANTINE).await.unwrap();

        // Expiry is NOW + 45; at exactly that instant the entry is live
        assert_eq!(backend.queue_timeout(&p, NOW + 45).await.unwrap(), 0);
        assert_eq!(backend.queue_timeout(&p, NOW + 46).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn store_timeout_expires_stale_members() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_store_timeout");
        set_capacity(&backend, &p, -1).await;

        let id = SessionId::generate();
        backend.id_add(&p, &id, NOW, VALIDATED, QUARANTINE).await.unwrap();

        assert_eq!(backend.store_timeout(&p, NOW + 600).await.unwrap(), 0);
        assert_eq!(backend.store_timeout(&p, NOW + 601).await.unwrap(), 1);
        assert_eq!(backend.store_size(&p).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_runs_all_three_phases_and_stamps() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_sweep");
        set_capacity(&backend, &p, 1).await;

        // One stored, two queued
        let ids: Vec<SessionId> = (0..3).map(|_| SessionId::generate()).collect();
        for id in &ids {
            backend.id_add(&p, id, NOW, VALIDATED, QUARANTINE).await.unwrap();
        }

        // Stored ID expires at NOW+600; queued at NOW+45. Sweep at NOW+100:
        // both queue entries expire, the store entry survives.
        let report = backend.sweep(&p, NOW + 100).await.unwrap();
        assert_eq!(report, SweepReport::new(2, 0, 0));

        // Sweep past the validated expiry: store empties, nothing to promote
        let report = backend.sweep(&p, NOW + 601).await.unwrap();
        assert_eq!(report, SweepReport::new(0, 1, 0));

        let status = backend.status(&p).await.unwrap();
        assert_eq!(status.sync_timestamp, Some(NOW + 601));
    }

    #[tokio::test]
    async fn sweep_promotes_after_expiry() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_sweep_promote");
        set_capacity(&backend, &p, 1).await;

        let first = SessionId::generate();
        let second = SessionId::generate();
        backend.id_add(&p, &first, NOW, VALIDATED, QUARANTINE).await.unwrap();
        backend.id_add(&p, &second, NOW, VALIDATED, QUARANTINE).await.unwrap();
        // Keep the queued session validated so it outlives the stored one
        backend.id_position(&p, &second, NOW + 500, VALIDATED, QUARANTINE).await.unwrap();

        let report = backend.sweep(&p, NOW + 601).await.unwrap();
        assert_eq!(report.store_expired, 1);
        assert_eq!(report.promoted, 1);
        assert_eq!(backend.store_snapshot(&p).unwrap(), vec![second.to_string()]);
    }

    #[tokio::test]
    async fn has_ids_signals_reinit_when_unseeded() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_has_ids");

        // Never seeded: report non-empty
        assert!(backend.has_ids(&p).await.unwrap());

        set_capacity(&backend, &p, 1).await;
        assert!(!backend.has_ids(&p).await.unwrap());

        let id = SessionId::generate();
        backend.id_add(&p, &id, NOW, VALIDATED, QUARANTINE).await.unwrap();
        assert!(backend.has_ids(&p).await.unwrap());

        backend.flush().unwrap();
        assert!(backend.has_ids(&p).await.unwrap());
    }

    #[tokio::test]
    async fn check_sync_keys_requires_all_three() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_sync_keys");

        assert!(!backend.check_sync_keys(&p).await.unwrap());

        backend
            .write_settings(&p, Some("1"), Some("5"), NOW)
            .await
            .unwrap();
        assert!(backend.check_sync_keys(&p).await.unwrap());

        backend.flush().unwrap();
        assert!(!backend.check_sync_keys(&p).await.unwrap());
    }

    #[tokio::test]
    async fn partial_settings_writes_leave_other_values() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_partial_write");

        backend.write_settings(&p, Some("1"), Some("5"), NOW).await.unwrap();
        backend.write_settings(&p, None, Some("9"), NOW + 1).await.unwrap();

        let status = backend.status(&p).await.unwrap();
        assert_eq!(status.enabled.as_deref(), Some("1"));
        assert_eq!(status.capacity.as_deref(), Some("9"));
        assert_eq!(status.sync_timestamp, Some(NOW + 1));
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_events");

        let mut receiver = backend.subscribe(&p).await.unwrap();
        backend.publish(&p, "queue:added").await.unwrap();
        assert_eq!(receiver.recv().await.unwrap(), "queue:added");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_events_nobody");
        backend.publish(&p, "queue:added").await.unwrap();
    }

    #[tokio::test]
    async fn lease_excludes_other_holders_but_renews_for_self() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_lease");
        let ttl = Duration::from_secs(30);

        assert!(backend.try_lease(&p, "worker-a", ttl).await.unwrap());
        assert!(!backend.try_lease(&p, "worker-b", ttl).await.unwrap());
        assert!(backend.try_lease(&p, "worker-a", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let backend = MemoryBackend::new();
        let p = prefix("mem_lease_expiry");

        assert!(backend
            .try_lease(&p, "worker-a", Duration::ZERO)
            .await
            .unwrap());
        assert!(backend
            .try_lease(&p, "worker-b", Duration::from_secs(30))
            .await
            .unwrap());
    }
}
