//! The housekeeping loop.
//!
//! One periodic task per process expires stale sessions, promotes from the
//! queue into freed store slots, and stamps the sync timestamp. Cycles are
//! serialized per process by an async mutex; across processes every mutation
//! is atomic, so concurrent housekeepers are correct — just wasteful. An
//! advisory lease (`SET NX PX`, TTL twice the period) keeps the work on one
//! worker at a time; losing the lease race skips the cycle, nothing more.
//!
//! Each cycle also re-seeds the control keys if the backing store was
//! flushed, which bounds the unconfigured window after a flush to one sweep
//! period.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::select;
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;
use tracing::{error, info, Instrument};
use ulid::Ulid;

use vestibule_core::error::Result;
use vestibule_core::observability::sweep_span;
use vestibule_core::{KeyPrefix, StoreCapacity, SweepReport};

use crate::control::AdmissionControl;
use crate::metrics::QueueMetrics;

/// Periodic housekeeper for one waiting room.
pub struct Housekeeper {
    control: Arc<AdmissionControl>,
    prefix: KeyPrefix,
    interval: Duration,
    seed_enabled: bool,
    seed_capacity: StoreCapacity,
    holder_id: String,
    cycle_lock: Mutex<()>,
    metrics: QueueMetrics,
}

impl Housekeeper {
    /// Creates a housekeeper sweeping `prefix` every `interval`.
    ///
    /// `seed_enabled` and `seed_capacity` re-seed the control keys when a
    /// cycle finds the backing store flushed.
    #[must_use]
    pub fn new(
        control: Arc<AdmissionControl>,
        prefix: KeyPrefix,
        interval: Duration,
        seed_enabled: bool,
        seed_capacity: StoreCapacity,
    ) -> Self {
        Self {
            control,
            prefix,
            interval,
            seed_enabled,
            seed_capacity,
            holder_id: Ulid::new().to_string(),
            cycle_lock: Mutex::new(()),
            metrics: QueueMetrics::new(),
        }
    }

    /// Identifier under which this housekeeper takes the sweep lease.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Runs cycles until `shutdown` is notified. Cycle failures are logged
    /// and the loop continues; the backing store owns all state, so a missed
    /// cycle only delays expiry.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!("starting housekeeper for \"{}\"", self.prefix);
        loop {
            if let Err(e) = self.run_cycle().await {
                error!("housekeeping cycle failed: {e:?}");
            }

            select! {
                () = shutdown.notified() => break,
                () = sleep(self.interval) => {}
            }
        }
        info!("housekeeper for \"{}\" shut down", self.prefix);
    }

    /// Runs one cycle: take the lease, re-seed if flushed, sweep, record.
    /// Returns `None` when another worker holds the lease.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    pub async fn run_cycle(&self) -> Result<Option<SweepReport>> {
        let _serialized = self.cycle_lock.lock().await;

        let span = sweep_span(self.prefix.as_str(), &self.holder_id);
        self.cycle_inner().instrument(span).await
    }

    async fn cycle_inner(&self) -> Result<Option<SweepReport>> {
        let leased = self
            .control
            .try_lease(&self.prefix, &self.holder_id, self.interval * 2)
            .await?;
        if !leased {
            return Ok(None);
        }

        if self
            .control
            .ensure_initialized(&self.prefix, self.seed_enabled, self.seed_capacity)
            .await?
        {
            info!("re-seeded control keys for \"{}\"", self.prefix);
        }

        let started = Instant::now();
        let report = self.control.sweep(&self.prefix, None).await?;
        self.metrics.record_sweep(&report, started.elapsed());

        if report.has_changes() {
            info!(
                "sweep: queue expired {}, store expired {}, promoted {}",
                report.queue_expired, report.store_expired, report.promoted
            );

            let status = self.control.status(&self.prefix).await?;
            self.metrics.record_sizes(status.queue_size, status.store_size);
            self.control.verify_waiting_page(&self.prefix).await;
        }

        Ok(Some(report))
    }
}
