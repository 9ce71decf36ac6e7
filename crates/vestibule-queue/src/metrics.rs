//! Observability metrics for the admission data plane.
//!
//! Exposed through the `metrics` crate facade; install any compatible
//! recorder (e.g. a Prometheus exporter) at process startup to collect them.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `vestibule_admissions_total` | Counter | `outcome` | New sessions placed, by `store` / `queue` |
//! | `vestibule_queue_expired_total` | Counter | - | Queue entries dropped by sweeps |
//! | `vestibule_store_expired_total` | Counter | - | Store entries dropped by sweeps |
//! | `vestibule_promotions_total` | Counter | - | Sessions promoted queue → store |
//! | `vestibule_sweep_duration_seconds` | Histogram | - | Housekeeping cycle duration |
//! | `vestibule_queue_depth` | Gauge | - | Queue length after the last sweep |
//! | `vestibule_store_size` | Gauge | - | Store size after the last sweep |

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use vestibule_core::{Placement, SweepReport};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: new sessions placed, labeled by outcome.
    pub const ADMISSIONS_TOTAL: &str = "vestibule_admissions_total";
    /// Counter: queue entries dropped by sweeps.
    pub const QUEUE_EXPIRED_TOTAL: &str = "vestibule_queue_expired_total";
    /// Counter: store entries dropped by sweeps.
    pub const STORE_EXPIRED_TOTAL: &str = "vestibule_store_expired_total";
    /// Counter: sessions promoted from queue to store.
    pub const PROMOTIONS_TOTAL: &str = "vestibule_promotions_total";
    /// Histogram: housekeeping cycle duration in seconds.
    pub const SWEEP_DURATION_SECONDS: &str = "vestibule_sweep_duration_seconds";
    /// Gauge: queue length after the last sweep.
    pub const QUEUE_DEPTH: &str = "vestibule_queue_depth";
    /// Gauge: store size after the last sweep.
    pub const STORE_SIZE: &str = "vestibule_store_size";
}

/// Recorder for admission data-plane metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueMetrics;

impl QueueMetrics {
    /// Creates a metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a newly placed session.
    pub fn record_admission(&self, placement: Placement) {
        let outcome = match placement {
            Placement::Store => "store",
            Placement::Queued(_) => "queue",
        };
        counter!(names::ADMISSIONS_TOTAL, "outcome" => outcome).increment(1);
    }

    /// Records the counts of one housekeeping sweep.
    pub fn record_sweep(&self, report: &SweepReport, duration: Duration) {
        counter!(names::QUEUE_EXPIRED_TOTAL).increment(report.queue_expired);
        counter!(names::STORE_EXPIRED_TOTAL).increment(report.store_expired);
        counter!(names::PROMOTIONS_TOTAL).increment(report.promoted);
        histogram!(names::SWEEP_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records the sizes observed after a sweep.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_sizes(&self, queue_size: u64, store_size: u64) {
        gauge!(names::QUEUE_DEPTH).set(queue_size as f64);
        gauge!(names::STORE_SIZE).set(store_size as f64);
    }
}
