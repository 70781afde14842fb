//! Camera stream multiplexing.
//!
//! Each session with a connected device owns one stream session: a camera
//! port, an upstream URL and a set of downstream clients. The upstream is
//! only pulled while at least one client exists.
//!
//! - [`ports`]: Port pool shared by every stream session
//! - [`multiplexer`]: Downstream client set and byte fan-out
//! - [`upstream`]: Upstream sources and the pump task
//! - [`server`]: Per-port TCP server for downstream viewers
//! - [`manager`]: Stream session lifecycle

pub mod manager;
pub mod multiplexer;
pub mod ports;
pub mod server;
pub mod upstream;

use protocol::SessionId;
use thiserror::Error;

pub use manager::{ClientLease, StreamInfo, StreamManager};
pub use multiplexer::{ClientCounts, ClientId, ClientKind, ClientStats, StreamFanout};
pub use ports::{PortError, PortPool};
pub use upstream::{ByteStream, HttpUpstream, MemoryUpstream, UpstreamSource};

/// Errors that can occur in stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// No stream session exists for the session.
    #[error("stream session not found: {0}")]
    NotFound(SessionId),

    /// The client is not registered with the stream session.
    #[error("client {client_id} not found in stream session {session_id}")]
    ClientNotFound {
        session_id: SessionId,
        client_id: ClientId,
    },

    /// A stream session already exists for the session.
    #[error("stream session already open: {0}")]
    AlreadyOpen(SessionId),

    /// The upstream URL could not be parsed.
    #[error("invalid stream url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Ports(#[from] PortError),

    /// The downstream listener could not be bound.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The upstream could not be reached or broke mid-stream.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}

/// Checks that `url` is an absolute http(s) URL.
pub fn validate_stream_url(url: &str) -> Result<(), StreamError> {
    let parsed = url::Url::parse(url).map_err(|e| StreamError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(StreamError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}
