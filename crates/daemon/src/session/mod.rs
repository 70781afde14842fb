//! Session management.
//!
//! A session is one managed printer connection. The [`SessionRegistry`] owns
//! every session, the single active pointer, and each session's dependent
//! service chain ([`SessionServices`]).

pub mod registry;
pub mod services;

use protocol::SessionId;
use thiserror::Error;

use crate::stream::StreamError;

pub use registry::{RegistryDeps, SessionInfo, SessionRegistry};
pub use services::{ServiceContext, SessionServices, TeardownReport};

/// Errors that can occur in session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The device identity is unusable.
    #[error("invalid device identity: {0}")]
    InvalidIdentity(String),

    /// Creating the session would exceed `session.max_sessions`.
    #[error("session limit reached ({0})")]
    LimitReached(usize),

    #[error(transparent)]
    Stream(#[from] StreamError),
}
