//! The admission client.
//!
//! [`AdmissionControl`] is the process-wide, thread-safe façade every
//! front-end talks to. It owns no admission state — all truth lives in the
//! backing store — only the expiry policy, the event-publish throttle, and a
//! per-prefix cache of the opaque waiting-page blob.
//!
//! Time is injected: every operation accepts an optional timestamp, and a
//! `None` resolves against the backing store's clock, so one authority
//! timestamps each request no matter how many front-ends are deployed or how
//! skewed their clocks are.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::error;

use vestibule_core::error::Result;
use vestibule_core::{
    Admission, AdmissionEvent, KeyPrefix, Placement, QueueEnabled, QueueSettings, QueueStatus,
    SessionId, StoreCapacity, SweepReport, VestibuleConfig,
};

use crate::backend::SharedBackend;
use crate::metrics::QueueMetrics;

/// Process-wide façade over the shared admission state machine.
pub struct AdmissionControl {
    backend: SharedBackend,
    validated_expiry: Duration,
    quarantine_expiry: Duration,
    publish_throttle: Duration,
    throttle: RwLock<HashMap<(String, AdmissionEvent), Instant>>,
    waiting_page_cache: RwLock<HashMap<String, String>>,
    metrics: QueueMetrics,
}

impl AdmissionControl {
    /// Creates a client over the given backend with the given expiry policy.
    #[must_use]
    pub fn new(
        backend: SharedBackend,
        validated_expiry: Duration,
        quarantine_expiry: Duration,
        publish_throttle: Duration,
    ) -> Self {
        Self {
            backend,
            validated_expiry,
            quarantine_expiry,
            publish_throttle,
            throttle: RwLock::new(HashMap::new()),
            waiting_page_cache: RwLock::new(HashMap::new()),
            metrics: QueueMetrics::new(),
        }
    }

    /// Creates a client with the expiry policy from a configuration.
    #[must_use]
    pub fn from_config(backend: SharedBackend, config: &VestibuleConfig) -> Self {
        Self::new(
            backend,
            config.validated_expiry(),
            config.quarantine_expiry(),
            config.publish_throttle(),
        )
    }

    /// Mints a new session ID.
    #[must_use]
    pub fn new_id(&self) -> SessionId {
        SessionId::generate()
    }

    /// Prepares a prefix for use: seeds the control keys if the backing
    /// store was flushed or never initialized, and warms the waiting-page
    /// cache.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn init(
        &self,
        prefix: &KeyPrefix,
        enabled: bool,
        capacity: StoreCapacity,
    ) -> Result<()> {
        self.ensure_initialized(prefix, enabled, capacity).await?;
        self.verify_waiting_page(prefix).await;
        Ok(())
    }

    /// Seeds enabled, capacity, and the sync timestamp when the sync keys
    /// are absent. Returns whether seeding happened.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn ensure_initialized(
        &self,
        prefix: &KeyPrefix,
        enabled: bool,
        capacity: StoreCapacity,
    ) -> Result<bool> {
        if self.backend.check_sync_keys(prefix).await? {
            return Ok(false);
        }

        let now = self.resolve_now(None).await?;
        self.backend
            .write_settings(
                prefix,
                Some(&String::from(QueueEnabled(enabled))),
                Some(&i64::from(capacity).to_string()),
                now,
            )
            .await?;
        self.emit(prefix, AdmissionEvent::SettingsUpdated, None).await;
        Ok(true)
    }

    async fn resolve_now(&self, time: Option<DateTime<Utc>>) -> Result<i64> {
        let time = match time {
            Some(t) => t,
            None => self.backend.current_time().await?,
        };
        Ok(time.timestamp())
    }

    /// The hot path: returns the session's placement, inserting it if
    /// absent and refreshing its expiry if present. Position 0 means
    /// admitted to the store.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn position_or_add(
        &self,
        prefix: &KeyPrefix,
        id: SessionId,
        time: Option<DateTime<Utc>>,
    ) -> Result<Admission> {
        let now = self.resolve_now(time).await?;
        let (added, position) = self
            .backend
            .id_position(prefix, &id, now, self.validated_expiry, self.quarantine_expiry)
            .await?;

        let placement = Placement::from_position(position);
        if added {
            self.metrics.record_admission(placement);
            let event = match placement {
                Placement::Store => AdmissionEvent::StoreAdded,
                Placement::Queued(_) => AdmissionEvent::QueueAdded,
            };
            self.emit(prefix, event, None).await;
        }

        Ok(Admission { added, placement })
    }

    /// Places the session if absent, refreshing its expiry otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn add(
        &self,
        prefix: &KeyPrefix,
        id: SessionId,
        time: Option<DateTime<Utc>>,
    ) -> Result<Placement> {
        let now = self.resolve_now(time).await?;
        let position = self
            .backend
            .id_add(prefix, &id, now, self.validated_expiry, self.quarantine_expiry)
            .await?;

        let placement = Placement::from_position(position);
        let event = match placement {
            Placement::Store => AdmissionEvent::StoreAdded,
            Placement::Queued(_) => AdmissionEvent::QueueAdded,
        };
        self.emit(prefix, event, None).await;

        Ok(placement)
    }

    /// Removes the session: eagerly from the store, lazily from the queue.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn remove(
        &self,
        prefix: &KeyPrefix,
        id: SessionId,
        time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = self.resolve_now(time).await?;
        self.backend.id_remove(prefix, &id, now).await?;
        self.emit(prefix, AdmissionEvent::QueueRemoved, None).await;
        Ok(())
    }

    /// Moves the session into the store regardless of capacity
    /// (administrative override).
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn promote(
        &self,
        prefix: &KeyPrefix,
        id: SessionId,
        time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = self.resolve_now(time).await?;
        self.backend
            .id_promote(prefix, &id, now, self.validated_expiry)
            .await?;
        self.emit(prefix, AdmissionEvent::StorePromoted, None).await;
        Ok(())
    }

    /// Moves up to `n` sessions from the queue front into the store
    /// regardless of capacity. Returns the number moved.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn promote_n(&self, prefix: &KeyPrefix, n: u64) -> Result<u64> {
        let moved = self.backend.store_promote_n(prefix, n).await?;
        if moved > 0 {
            self.emit(prefix, AdmissionEvent::StorePromoted, None).await;
        }
        Ok(moved)
    }

    /// Runs one full housekeeping sweep: expiry of both containers,
    /// promotion into freed slots, and the sync-timestamp write, atomically.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn sweep(
        &self,
        prefix: &KeyPrefix,
        time: Option<DateTime<Utc>>,
    ) -> Result<SweepReport> {
        let now = self.resolve_now(time).await?;
        let report = self.backend.sweep(prefix, now).await?;

        if report.queue_expired > 0 {
            self.emit(prefix, AdmissionEvent::QueueExpired, None).await;
        }
        if report.store_expired > 0 {
            self.emit(prefix, AdmissionEvent::StoreExpired, None).await;
        }
        if report.promoted > 0 {
            self.emit(prefix, AdmissionEvent::StorePromoted, None).await;
        }

        Ok(report)
    }

    /// Reports whether any session IDs exist under the prefix. An unseeded
    /// prefix reports `true` so callers re-initialize before trusting it.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn has_ids(&self, prefix: &KeyPrefix) -> Result<bool> {
        self.backend.has_ids(prefix).await
    }

    /// Reports whether the control keys required for synchronization exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn check_sync_keys(&self, prefix: &KeyPrefix) -> Result<bool> {
        self.backend.check_sync_keys(prefix).await
    }

    /// Reads an atomic snapshot of the waiting room's state.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable or a control
    /// value is unparseable.
    pub async fn status(&self, prefix: &KeyPrefix) -> Result<QueueStatus> {
        let raw = self.backend.status(prefix).await?;
        Ok(QueueStatus {
            enabled: QueueEnabled::try_from(raw.enabled)?.into(),
            capacity: StoreCapacity::try_from(raw.capacity)?,
            queue_size: raw.queue_size,
            store_size: raw.store_size,
            updated: raw.sync_timestamp.and_then(|t| DateTime::from_timestamp(t, 0)),
        })
    }

    /// Reads the waiting room's configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable or a control
    /// value is unparseable.
    pub async fn settings(&self, prefix: &KeyPrefix) -> Result<QueueSettings> {
        let status = self.status(prefix).await?;
        Ok(QueueSettings {
            enabled: status.enabled,
            capacity: status.capacity,
            updated: status.updated,
        })
    }

    /// Writes the enabled flag and capacity, stamping the sync timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn set_settings(
        &self,
        prefix: &KeyPrefix,
        enabled: bool,
        capacity: StoreCapacity,
    ) -> Result<()> {
        let now = self.resolve_now(None).await?;
        self.backend
            .write_settings(
                prefix,
                Some(&String::from(QueueEnabled(enabled))),
                Some(&i64::from(capacity).to_string()),
                now,
            )
            .await?;
        self.emit(prefix, AdmissionEvent::SettingsUpdated, None).await;
        Ok(())
    }

    /// Writes the enabled flag, stamping the sync timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn set_queue_enabled(&self, prefix: &KeyPrefix, enabled: bool) -> Result<()> {
        let now = self.resolve_now(None).await?;
        self.backend
            .write_settings(prefix, Some(&String::from(QueueEnabled(enabled))), None, now)
            .await?;
        self.emit(prefix, AdmissionEvent::SettingsUpdated, None).await;
        Ok(())
    }

    /// Writes the store capacity, stamping the sync timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn set_store_capacity(
        &self,
        prefix: &KeyPrefix,
        capacity: StoreCapacity,
    ) -> Result<()> {
        let now = self.resolve_now(None).await?;
        self.backend
            .write_settings(prefix, None, Some(&i64::from(capacity).to_string()), now)
            .await?;
        self.emit(prefix, AdmissionEvent::SettingsUpdated, None).await;
        Ok(())
    }

    /// Reads the enabled flag; missing or unparseable values read as
    /// disabled.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn queue_enabled(&self, prefix: &KeyPrefix) -> Result<bool> {
        let raw = self.backend.queue_enabled_raw(prefix).await?;
        Ok(QueueEnabled::try_from(raw).map(bool::from).unwrap_or(false))
    }

    /// Reads the store capacity; a missing value reads as unbounded.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable or the value
    /// is unparseable.
    pub async fn store_capacity(&self, prefix: &KeyPrefix) -> Result<StoreCapacity> {
        let raw = self.backend.store_capacity_raw(prefix).await?;
        StoreCapacity::try_from(raw)
    }

    /// Current queue length.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn queue_size(&self, prefix: &KeyPrefix) -> Result<u64> {
        self.backend.queue_size(prefix).await
    }

    /// Current store size.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn store_size(&self, prefix: &KeyPrefix) -> Result<u64> {
        self.backend.store_size(prefix).await
    }

    /// Reads the waiting-page blob from the backing store.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn waiting_page(&self, prefix: &KeyPrefix) -> Result<Option<String>> {
        self.backend.waiting_page(prefix).await
    }

    /// Replaces the waiting-page blob.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn set_waiting_page(
        &self,
        prefix: &KeyPrefix,
        body: impl Into<String>,
    ) -> Result<()> {
        self.backend.set_waiting_page(prefix, &body.into()).await?;
        self.emit(prefix, AdmissionEvent::WaitingPageUpdated, None).await;
        Ok(())
    }

    /// Returns the cached waiting page, if one has been observed for the
    /// prefix. Serving from cache keeps the page available while the
    /// backing store is down.
    pub async fn cached_waiting_page(&self, prefix: &KeyPrefix) -> Option<String> {
        let cache = self.waiting_page_cache.read().await;
        cache.get(prefix.as_str()).cloned()
    }

    /// Refreshes the waiting-page cache from the backing store. Failures
    /// leave the cache untouched.
    pub async fn verify_waiting_page(&self, prefix: &KeyPrefix) {
        let cached = {
            let cache = self.waiting_page_cache.read().await;
            cache.get(prefix.as_str()).cloned()
        };

        let current = match self.backend.waiting_page(prefix).await {
            Ok(page) => page,
            Err(e) => {
                error!("failed to load waiting page while verifying cache: {e:?}");
                return;
            }
        };

        if cached != current {
            let mut cache = self.waiting_page_cache.write().await;
            match current {
                Some(page) => cache.insert(prefix.as_str().to_string(), page),
                None => cache.remove(prefix.as_str()),
            };
        }
    }

    /// Publishes an event on the prefix's events channel, coalescing events
    /// of the same kind inside the throttle window. `now` overrides the
    /// clock for tests.
    pub async fn emit(&self, prefix: &KeyPrefix, event: AdmissionEvent, now: Option<Instant>) {
        let key = (prefix.as_str().to_string(), event);

        {
            let throttle = self.throttle.read().await;
            let now = now.unwrap_or_else(Instant::now);
            if let Some(last) = throttle.get(&key) {
                if now.duration_since(*last) < self.publish_throttle {
                    // EARLY EXIT: this event kind was published recently
                    return;
                }
            }
        }

        if let Err(e) = self.backend.publish(prefix, event.as_str()).await {
            // EARLY EXIT: delivery is best-effort; the next sweep republishes
            error!("failed to publish event \"{event}\": {e:?}");
            return;
        }

        let now = now.unwrap_or_else(Instant::now);
        let mut throttle = self.throttle.write().await;
        throttle.insert(key, now);
    }

    /// Evicts throttle entries older than the window. `now` overrides the
    /// clock for tests.
    pub async fn flush_publish_throttle(&self, now: Option<Instant>) {
        let mut throttle = self.throttle.write().await;
        let now = now.unwrap_or_else(Instant::now);
        throttle.retain(|_, last| now.duration_since(*last) < self.publish_throttle);
    }

    /// Attempts to take (or renew, for the same holder) the advisory sweep
    /// lease. Returns whether the caller holds it for the next `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn try_lease(
        &self,
        prefix: &KeyPrefix,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.backend.try_lease(prefix, holder, ttl).await
    }

    /// Subscribes to the raw event payloads published for a prefix.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn subscribe(&self, prefix: &KeyPrefix) -> Result<broadcast::Receiver<String>> {
        self.backend.subscribe(prefix).await
    }

    /// Spawns a listener that invokes `callback` for every event whose raw
    /// payload matches `pattern` (canonically `^(settings|queue|store):`).
    /// Unparseable payloads are skipped; delivery is best-effort and the
    /// task ends when the event channel closes.
    ///
    /// # Errors
    ///
    /// Returns an error when the subscription cannot be established.
    pub async fn watch(
        &self,
        prefix: &KeyPrefix,
        pattern: Regex,
        callback: impl Fn(AdmissionEvent) + Send + Sync + 'static,
    ) -> Result<JoinHandle<()>> {
        let mut receiver = self.backend.subscribe(prefix).await?;

        Ok(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => {
                        if !pattern.is_match(&payload) {
                            continue;
                        }
                        let Ok(event) = AdmissionEvent::try_from(payload.as_str()) else {
                            continue;
                        };
                        callback(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }
}
