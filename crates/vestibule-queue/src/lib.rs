//! # vestibule-queue
//!
//! The shared admission state machine for the Vestibule admission-control
//! system.
//!
//! A bounded **store** holds the session IDs currently admitted to upstream
//! service; a FIFO **queue** holds the IDs waiting for a slot. Both live in
//! a single Redis instance shared by every front-end, and are mutated only
//! by atomic server-side scripts, so any number of stateless processes see
//! one consistent waiting room.
//!
//! This crate provides:
//!
//! - **Atomic Scripts**: embedded Lua implementing placement, touch,
//!   removal, promotion, and expiry as indivisible units
//! - **Backends**: [`backend::RedisBackend`] for production and
//!   [`backend::MemoryBackend`], a semantic twin for tests
//! - **Admission Client**: [`control::AdmissionControl`], the stateless
//!   per-process façade with event publication and time injection
//! - **Housekeeper**: [`housekeeper::Housekeeper`], the periodic
//!   expire/promote/stamp loop with advisory leasing
//!
//! ## Guarantees
//!
//! - **No duplicate admission**: membership checks precede every insert
//!   inside one atomic unit, so retries refresh instead of re-adding
//! - **FIFO**: queue order is append-tail/pop-head, never reordered
//! - **Heartbeat by touch**: any successful position lookup refreshes the
//!   session's expiry; no separate keepalive traffic exists
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vestibule_core::{KeyPrefix, StoreCapacity};
//! use vestibule_queue::backend::MemoryBackend;
//! use vestibule_queue::control::AdmissionControl;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> vestibule_core::Result<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! let control = AdmissionControl::new(
//!     backend,
//!     Duration::from_secs(600),
//!     Duration::from_secs(45),
//!     Duration::ZERO,
//! );
//!
//! let prefix = KeyPrefix::new("shop");
//! control.init(&prefix, true, StoreCapacity::Sized(100)).await?;
//!
//! let id = control.new_id();
//! let admission = control.position_or_add(&prefix, id, None).await?;
//! assert!(admission.placement.is_admitted());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod control;
pub mod housekeeper;
pub mod metrics;

mod scripts;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backend::{
        AdmissionBackend, AtomicOps, ClockOps, EventOps, LeaseOps, MemoryBackend, RawStatus,
        RedisBackend, SettingsOps, SharedBackend,
    };
    pub use crate::control::AdmissionControl;
    pub use crate::housekeeper::Housekeeper;
    pub use crate::metrics::QueueMetrics;
}

pub use backend::{AdmissionBackend, MemoryBackend, RedisBackend, SharedBackend};
pub use control::AdmissionControl;
pub use housekeeper::Housekeeper;
pub use metrics::QueueMetrics;
