//! Events published by the session registry and its per-session services.

use serde::{Deserialize, Serialize};

use crate::status::{PrinterState, StatusSample};

/// Unique identifier for a session.
pub type SessionId = String;

/// Connection state of a session's device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Kind of a job lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Started,
    Completed,
    Cancelled,
    Error,
}

impl LifecycleKind {
    /// Returns true for events that close a job cycle.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// A discrete, de-duplicated job lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub session_id: SessionId,
    /// Job identifier. Absent only when the device never reported one.
    pub job: Option<String>,
    /// Sample that triggered the event.
    pub status: StatusSample,
    /// Unix milliseconds.
    pub timestamp: u64,
}

/// A plain state change, emitted before any lifecycle event it implies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub session_id: SessionId,
    pub from: PrinterState,
    pub to: PrinterState,
    pub timestamp: u64,
}

/// Emitted once per completed job when the bed has cooled below threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooledEvent {
    pub session_id: SessionId,
    pub job: Option<String>,
    /// Reading that crossed the threshold.
    pub temperature: f64,
    pub threshold: f64,
    pub timestamp: u64,
}

/// Per-session events merged for external subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Lifecycle(LifecycleEvent),
    Cooled(CooledEvent),
}

/// Events describing changes to the session registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    Created {
        session_id: SessionId,
        name: String,
    },
    Removed {
        session_id: SessionId,
    },
    Switched {
        previous: Option<SessionId>,
        current: SessionId,
    },
    ConnectionChanged {
        session_id: SessionId,
        state: ConnectionState,
    },
}

/// Observable health of a session's camera stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// No clients, no upstream connection.
    Idle,
    /// Clients registered, upstream connection being established.
    Starting,
    /// Upstream connected and bytes flowing.
    Streaming,
    /// Upstream unavailable; retrying while clients remain.
    Degraded,
}

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PrintComplete,
    Cooled,
}

/// A decision to notify the user. Delivery is up to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationDecision {
    pub session_id: SessionId,
    pub kind: NotificationKind,
    pub job: Option<String>,
    pub timestamp: u64,
}

/// User notification preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Master switch.
    pub enabled: bool,
    pub on_print_complete: bool,
    pub on_cooled: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            on_print_complete: true,
            on_cooled: true,
        }
    }
}

impl NotificationSettings {
    pub fn allows(&self, kind: NotificationKind) -> bool {
        self.enabled
            && match kind {
                NotificationKind::PrintComplete => self.on_print_complete,
                NotificationKind::Cooled => self.on_cooled,
            }
    }
}
