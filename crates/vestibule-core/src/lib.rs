//! # vestibule-core
//!
//! Shared primitives for the Vestibule admission-control system.
//!
//! Vestibule gates user sessions in front of a fleet of upstream servers with
//! finite concurrent-session capacity: admitted sessions live in a bounded
//! **store**, excess sessions wait in a FIFO **queue**, and queued sessions
//! are promoted as store slots free up. All state is shared across stateless
//! front-ends through a single Redis instance.
//!
//! This crate provides the types every component agrees on:
//!
//! - **Session IDs**: strongly-typed session identifiers
//! - **Settings**: store capacity, queue-enabled flag, status snapshots
//! - **Events**: the `{settings|queue|store}:<verb>` change-notification taxonomy
//! - **Keys**: typed builders for the Redis key layout under a prefix
//! - **Errors**: shared error definitions and result types
//! - **Configuration**: the recognized option surface with defaults
//!
//! ## Crate Boundary
//!
//! `vestibule-core` is the only crate allowed to define shared primitives.
//! It carries no Redis dependency; the data plane lives in `vestibule-queue`.
//!
//! ## Example
//!
//! ```rust
//! use vestibule_core::prelude::*;
//!
//! let prefix = KeyPrefix::new("shop");
//! let id = SessionId::generate();
//!
//! assert_eq!(prefix.queue_ids(), "shop:queue_ids");
//! assert!(StoreCapacity::Unlimited.admits(9999));
//! # let _ = id;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod keys;
pub mod observability;
pub mod settings;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use vestibule_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::VestibuleConfig;
    pub use crate::error::{Error, Result};
    pub use crate::event::AdmissionEvent;
    pub use crate::id::SessionId;
    pub use crate::keys::KeyPrefix;
    pub use crate::settings::{
        Admission, Placement, QueueEnabled, QueueSettings, QueueStatus, StoreCapacity, SweepReport,
    };
}

pub use config::VestibuleConfig;
pub use error::{Error, Result};
pub use event::AdmissionEvent;
pub use id::SessionId;
pub use keys::KeyPrefix;
pub use observability::{init_logging, LogFormat};
pub use settings::{
    Admission, Placement, QueueEnabled, QueueSettings, QueueStatus, StoreCapacity, SweepReport,
};
