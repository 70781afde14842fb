//! IPC message types for CLI-daemon communication.
//!
//! This module defines the request and response types used for communication
//! between the CLI and the daemon over Unix Domain Sockets.

use protocol::NotificationSettings;
use serde::{Deserialize, Serialize};

use crate::device::DeviceIdentity;
use crate::session::{SessionError, SessionInfo};
use crate::stream::StreamError;

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List all sessions.
    ListSessions,
    /// Start managing a printer.
    CreateSession { identity: DeviceIdentity },
    /// Make a session the active one.
    SwitchActive { session_id: String },
    /// Stop managing a printer.
    RemoveSession { session_id: String },
    /// Toggle the keep-alive stream client of a session.
    SetKeepalive { session_id: String, enabled: bool },
    /// Point a session's camera at a new URL.
    ReassignStreamUrl { session_id: String, url: String },
    /// Replace the notification preferences.
    UpdateNotificationSettings { settings: NotificationSettings },
}

/// Category of a failed request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidRequest,
    UpstreamUnavailable,
    Internal,
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of managed sessions.
        session_count: usize,
        /// The active session, if any.
        active_session: Option<String>,
        /// Camera ports currently assigned.
        ports_in_use: usize,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// All managed sessions.
    Sessions { sessions: Vec<SessionInfo> },
    SessionCreated { session_id: String },
    Switched {
        previous: Option<String>,
        current: String,
    },
    /// The session is gone; `error` carries the first teardown failure.
    SessionRemoved {
        session_id: String,
        error: Option<String>,
    },
    /// `port` is the camera port the stream holds afterwards.
    KeepaliveSet {
        session_id: String,
        enabled: bool,
        port: Option<u16>,
    },
    /// `port` is `None` when the stream has no clients or the device is not
    /// connected yet.
    StreamReassigned {
        session_id: String,
        port: Option<u16>,
    },
    SettingsUpdated { settings: NotificationSettings },
    /// An error occurred processing the request.
    Error {
        kind: ErrorKind,
        /// Human-readable error message.
        message: String,
    },
}

impl IpcResponse {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }
}

impl From<&SessionError> for ErrorKind {
    fn from(error: &SessionError) -> Self {
        match error {
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::InvalidIdentity(_) | SessionError::LimitReached(_) => {
                ErrorKind::InvalidRequest
            }
            SessionError::Stream(e) => ErrorKind::from(e),
        }
    }
}

impl From<&StreamError> for ErrorKind {
    fn from(error: &StreamError) -> Self {
        match error {
            StreamError::NotFound(_) | StreamError::ClientNotFound { .. } => ErrorKind::NotFound,
            StreamError::InvalidUrl { .. } | StreamError::AlreadyOpen(_) => {
                ErrorKind::InvalidRequest
            }
            StreamError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            StreamError::Ports(_) | StreamError::Bind { .. } => ErrorKind::Internal,
        }
    }
}

impl From<SessionError> for IpcResponse {
    fn from(error: SessionError) -> Self {
        IpcResponse::error(ErrorKind::from(&error), error.to_string())
    }
}
