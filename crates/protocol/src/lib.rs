//! # printhub Protocol Library
//!
//! Shared model for the printhub daemon and its clients.
//!
//! ## Overview
//!
//! - **Status Samples**: raw device status and its validated form
//! - **Events**: job lifecycle, cooldown, registry and stream status events
//! - **Notification Model**: settings and notify decisions
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{PrinterState, RawStatus};
//!
//! let raw = RawStatus::new("printing").with_job("benchy.gcode").with_bed_temp(60.0);
//! let sample = raw.validate().unwrap();
//! assert_eq!(sample.state, PrinterState::Printing);
//! assert!(sample.state.is_busy());
//! ```
//!
//! ## Modules
//!
//! - [`status`]: Printer states and status samples
//! - [`events`]: Event and notification types
//! - [`error`]: Error types

use std::time::{SystemTime, UNIX_EPOCH};

pub mod error;
pub mod events;
pub mod status;

pub use error::{ProtocolError, Result};
pub use events::{
    ConnectionState, CooledEvent, LifecycleEvent, LifecycleKind, NotificationDecision,
    NotificationKind, NotificationSettings, RegistryEvent, SessionEvent, SessionId,
    StateTransition, StreamStatus,
};
pub use status::{PrinterState, RawStatus, StatusSample};

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
