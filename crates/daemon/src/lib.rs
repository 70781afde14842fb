//! # printhub Daemon Library
//!
//! Manages many 3D printers from one process: one session per printer, one
//! active session at a time, and a shared camera stream per printer that any
//! number of local viewers can attach to.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Hub Orchestrator  <── IPC socket           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                    Session Registry                        │  │
//! │  │   per session:  device feed -> transition monitor          │  │
//! │  │                   -> cooldown / usage / notifications      │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │  ┌─────────────────────────┐  ┌────────────────────────────────┐ │
//! │  │     Stream Manager      │  │          Port Pool             │ │
//! │  │  upstream pump, fan-out │  │   one camera port per session  │ │
//! │  └─────────────────────────┘  └────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, HubOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = HubOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Wait for shutdown signal...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`device`]: Device identity and status feeds
//! - [`monitor`]: Per-session state, cooldown, usage and notification services
//! - [`stream`]: Camera stream multiplexing and port allocation
//! - [`session`]: Session registry and service chains
//! - [`orchestrator`]: Main daemon coordinator
//! - [`ipc`]: Administrative Unix socket

pub mod backoff;
pub mod config;
pub mod device;
pub mod ipc;
pub mod monitor;
pub mod orchestrator;
pub mod session;
pub mod stream;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use device::{DeviceConnector, DeviceIdentity, HttpStatusConnector, ManualConnector};

pub use session::{SessionError, SessionInfo, SessionRegistry, TeardownReport};

pub use stream::{ClientKind, StreamError, StreamManager};

pub use orchestrator::{HubComponents, HubOrchestrator, OrchestratorEvent, OrchestratorState};
