//! Unix Domain Socket IPC for CLI-daemon communication.
//!
//! Newline-delimited JSON: each message is a single JSON object followed by a
//! newline. One connection may carry any number of request/response pairs.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/printhub/daemon.sock`
//! - Fallback: `/tmp/printhub-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{get_socket_path, IpcClient, IpcResponse};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     if let IpcResponse::Sessions { sessions } = client.list_sessions().await? {
//!         for session in sessions {
//!             println!("{} {:?}", session.name, session.state);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{ErrorKind, IpcRequest, IpcResponse};
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running, PidFile};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Get the socket path for IPC communication.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/printhub/daemon.sock`
/// 2. Otherwise: `/tmp/printhub-$UID/daemon.sock`
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("printhub").join("daemon.sock")
    } else {
        let uid = std::fs::metadata("/proc/self")
            .map(|m| m.uid())
            .unwrap_or(0);

        PathBuf::from(format!("/tmp/printhub-{}", uid)).join("daemon.sock")
    }
}
