//! PID file utilities for daemon running detection.
//!
//! The PID file is stored at:
//! - `$XDG_DATA_HOME/printhub/daemon.pid` if XDG_DATA_HOME is set
//! - `~/.local/share/printhub/daemon.pid` otherwise
//!
//! ## Example
//!
//! ```rust
//! use daemon::ipc::pidfile::{get_daemon_pid, is_daemon_running};
//!
//! if is_daemon_running() {
//!     if let Some(pid) = get_daemon_pid() {
//!         println!("Daemon is already running with PID {}", pid);
//!     }
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Get the path to the daemon PID file.
///
/// `XDG_DATA_HOME` wins over the home directory; `/tmp` is the last resort
/// when neither is known.
///
/// ## Example
///
/// ```rust,no_run
/// use daemon::ipc::pidfile::get_pid_file_path;
///
/// let path = get_pid_file_path();
/// assert!(path.ends_with("printhub/daemon.pid"));
/// ```
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("printhub").join("daemon.pid")
}

/// Check if a daemon process is currently running.
///
/// True only when the PID file names a live process. A stale file is
/// removed as a side effect.
///
/// ## Example
///
/// ```rust,no_run
/// use daemon::ipc::pidfile::is_daemon_running;
///
/// if is_daemon_running() {
///     eprintln!("printhub is already running");
///     std::process::exit(1);
/// }
/// ```
pub fn is_daemon_running() -> bool {
    get_daemon_pid().is_some()
}

/// Get the PID of the running daemon, if any.
///
/// Stale or unreadable PID files are removed.
pub fn get_daemon_pid() -> Option<u32> {
    read_live_pid(&get_pid_file_path())
}

/// Reads the PID stored at `path` if that process is alive.
pub fn read_live_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    let Ok(pid) = contents.trim().parse::<u32>() else {
        tracing::debug!(path = %path.display(), "Removing unparsable PID file");
        let _ = fs::remove_file(path);
        return None;
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        tracing::debug!(pid, "Removing stale PID file");
        let _ = fs::remove_file(path);
        None
    }
}

/// Owns the PID file for the lifetime of the daemon.
///
/// The file is removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current process id to `path`.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if a live daemon already
    /// owns the file.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(pid) = read_live_pid(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("daemon already running with PID {}", pid),
            ));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Check if a process with the given PID exists.
///
/// Signal 0 performs the permission and existence checks without
/// delivering anything.
fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}
