//! printhub daemon
//!
//! Multi-printer session manager with camera stream multiplexing.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::device::DeviceIdentity;
use daemon::ipc::{
    get_daemon_pid, get_pid_file_path, get_socket_path, IpcClient, IpcResponse, IpcServer,
    PidFile,
};
use daemon::orchestrator::{HubOrchestrator, OrchestratorEvent};
use daemon::session::SessionInfo;
use protocol::NotificationSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// printhub daemon - manage many printers from one place.
#[derive(Parser, Debug)]
#[command(name = "printhub-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage printer sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Replace the notification preferences
    NotifySettings {
        /// Turn all notifications off
        #[arg(long)]
        disable: bool,

        /// Do not notify when a print completes
        #[arg(long)]
        no_print_complete: bool,

        /// Do not notify when the bed has cooled
        #[arg(long)]
        no_cooled: bool,
    },
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start managing a printer
    Create {
        /// Display name
        name: String,

        /// Host name or address
        host: String,

        /// URL polled for JSON status
        #[arg(long)]
        status_url: Option<String>,

        /// Camera stream URL
        #[arg(long)]
        camera_url: Option<String>,

        /// Printer serial number
        #[arg(long)]
        serial: Option<String>,
    },

    /// Make a session the active one
    Switch {
        /// Session ID
        session_id: String,
    },

    /// Stop managing a printer
    Remove {
        /// Session ID
        session_id: String,
    },

    /// Keep a session's camera stream warm
    Keepalive {
        /// Session ID
        session_id: String,

        /// Disable instead of enable
        #[arg(long)]
        off: bool,
    },

    /// Point a session's camera at a new URL
    ReassignUrl {
        /// Session ID
        session_id: String,

        /// New camera stream URL
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let _log_guard = init_tracing(cli.verbose, &config)?;
    if let Some(path) = &cli.config {
        tracing::info!("Using config file: {:?}", path);
    }

    config.validate()?;

    match cli.command {
        Commands::Start => {
            if let Some(pid) = get_daemon_pid() {
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  printhub-daemon stop");
                std::process::exit(1);
            }

            let _pid_file =
                PidFile::create(get_pid_file_path()).context("Failed to write PID file")?;
            let mut orchestrator = HubOrchestrator::new(config)?;
            run_headless(&mut orchestrator).await?;
        }
        Commands::Stop { force, timeout } => {
            tracing::info!("Stopping daemon (force: {})", force);

            let result = if force {
                force_stop_daemon()
            } else {
                graceful_stop_daemon(timeout).await
            };
            match result {
                Ok(()) => println!("Daemon stopped"),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    if !force {
                        eprintln!("Try: printhub-daemon stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => {
            let mut client = connect().await?;
            match expect_ok(client.status().await?)? {
                IpcResponse::Status {
                    running,
                    uptime_secs,
                    session_count,
                    active_session,
                    ports_in_use,
                } => {
                    println!(
                        "Daemon Status: {}",
                        if running { "running" } else { "stopping" }
                    );
                    println!("  Uptime:   {}", format_duration(uptime_secs));
                    println!("  Sessions: {}", session_count);
                    println!("  Active:   {}", active_session.as_deref().unwrap_or("-"));
                    println!("  Ports:    {} in use", ports_in_use);
                }
                other => unexpected(other)?,
            }
        }
        Commands::Sessions(cmd) => run_sessions_command(cmd).await?,
        Commands::NotifySettings {
            disable,
            no_print_complete,
            no_cooled,
        } => {
            let settings = NotificationSettings {
                enabled: !disable,
                on_print_complete: !no_print_complete,
                on_cooled: !no_cooled,
            };
            let mut client = connect().await?;
            match expect_ok(client.update_notification_settings(settings).await?)? {
                IpcResponse::SettingsUpdated { settings } => {
                    println!(
                        "Notifications: {} (print complete: {}, cooled: {})",
                        on_off(settings.enabled),
                        on_off(settings.on_print_complete),
                        on_off(settings.on_cooled)
                    );
                }
                other => unexpected(other)?,
            }
        }
    }

    Ok(())
}

/// Installs the global subscriber.
///
/// Logs go to stderr, and additionally to a daily rolling file when
/// `daemon.log_dir` is set. The returned guard flushes the file writer.
fn init_tracing(verbose: bool, config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_new(format!("{},hyper=warn,reqwest=warn", level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "printhub.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

async fn run_sessions_command(cmd: SessionsCommands) -> anyhow::Result<()> {
    let mut client = connect().await?;

    match cmd {
        SessionsCommands::List { json } => match expect_ok(client.list_sessions().await?)? {
            IpcResponse::Sessions { sessions } => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&sessions)?);
                } else {
                    print_sessions_table(&sessions);
                }
            }
            other => unexpected(other)?,
        },
        SessionsCommands::Create {
            name,
            host,
            status_url,
            camera_url,
            serial,
        } => {
            let mut identity = DeviceIdentity::new(name, host);
            identity.status_url = status_url;
            identity.camera_url = camera_url;
            identity.serial = serial;

            match expect_ok(client.create_session(identity).await?)? {
                IpcResponse::SessionCreated { session_id } => println!("{}", session_id),
                other => unexpected(other)?,
            }
        }
        SessionsCommands::Switch { session_id } => {
            match expect_ok(client.switch_active(session_id).await?)? {
                IpcResponse::Switched { previous, current } => {
                    println!(
                        "Active session: {} (was {})",
                        current,
                        previous.as_deref().unwrap_or("none")
                    );
                }
                other => unexpected(other)?,
            }
        }
        SessionsCommands::Remove { session_id } => {
            match expect_ok(client.remove_session(session_id).await?)? {
                IpcResponse::SessionRemoved { session_id, error } => match error {
                    None => println!("Session {} removed", session_id),
                    Some(error) => {
                        println!("Session {} removed with teardown error: {}", session_id, error)
                    }
                },
                other => unexpected(other)?,
            }
        }
        SessionsCommands::Keepalive { session_id, off } => {
            match expect_ok(client.set_keepalive(session_id, !off).await?)? {
                IpcResponse::KeepaliveSet {
                    session_id,
                    enabled,
                    port,
                } => match port {
                    Some(port) => println!(
                        "Keep-alive {} for {}, streaming on port {}",
                        on_off(enabled),
                        session_id,
                        port
                    ),
                    None => println!("Keep-alive {} for {}", on_off(enabled), session_id),
                },
                other => unexpected(other)?,
            }
        }
        SessionsCommands::ReassignUrl { session_id, url } => {
            match expect_ok(client.reassign_stream_url(session_id, url).await?)? {
                IpcResponse::StreamReassigned { session_id, port } => match port {
                    Some(port) => println!("Session {} now streams on port {}", session_id, port),
                    None => println!("Session {} will use the new URL", session_id),
                },
                other => unexpected(other)?,
            }
        }
    }

    Ok(())
}

async fn connect() -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(&get_socket_path(), Duration::from_secs(5))
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Turns an error response into an `Err`.
fn expect_ok(response: IpcResponse) -> anyhow::Result<IpcResponse> {
    match response {
        IpcResponse::Error { kind, message } => {
            anyhow::bail!("Daemon returned {:?} error: {}", kind, message)
        }
        other => Ok(other),
    }
}

fn unexpected(response: IpcResponse) -> anyhow::Result<()> {
    anyhow::bail!("Unexpected response from daemon: {:?}", response)
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionInfo]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let id_width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(8).max(8);
    let name_width = sessions
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(4)
        .clamp(4, 24);

    println!(
        "{:<id_width$}  {:<name_width$}  {:<12}  {:<6}  {:>5}  {:>10}",
        "ID", "NAME", "STATE", "ACTIVE", "PORT", "LAST SEEN"
    );
    println!("{}", "-".repeat(id_width + name_width + 47));

    for session in sessions {
        let port = session
            .camera_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<id_width$}  {:<name_width$}  {:<12}  {:<6}  {:>5}  {:>10}",
            session.id,
            truncate_str(&session.name, name_width),
            format!("{:?}", session.state),
            if session.is_active { "*" } else { "" },
            port,
            format_relative_time(session.last_activity),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix millisecond timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp_ms: u64) -> String {
    let elapsed = protocol::now_millis().saturating_sub(timestamp_ms) / 1000;

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum number of characters, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Gracefully stop the daemon via IPC and wait for it to exit.
async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();
    let mut client = connect().await?;

    println!("Sending shutdown request...");
    client.set_timeout(Duration::from_secs(timeout_secs));
    match expect_ok(client.stop().await?)? {
        IpcResponse::Stopping => println!("Shutdown acknowledged, waiting for daemon to exit..."),
        other => unexpected(other)?,
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }
        if IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Force stop the daemon using SIGKILL.
fn force_stop_daemon() -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = get_daemon_pid()
        .ok_or_else(|| anyhow::anyhow!("No running daemon found - is the daemon running?"))?;
    let raw = i32::try_from(pid).context("PID out of range")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {})", pid))?;
    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(get_pid_file_path());
    let _ = std::fs::remove_file(get_socket_path());

    Ok(())
}

/// Run the daemon until a signal or an IPC stop request arrives.
async fn run_headless(orchestrator: &mut HubOrchestrator) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    orchestrator.start().await?;

    let socket_path = get_socket_path();
    let server = IpcServer::bind(&socket_path)
        .await
        .with_context(|| format!("Failed to bind IPC socket: {}", socket_path.display()))?;
    orchestrator.serve_ipc(server);

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Registry(_) => {}
                OrchestratorEvent::Session(event) => {
                    tracing::debug!(event = ?event, "Session event");
                }
            }
        }
    });

    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
        _ = shutdown.cancelled() => tracing::info!("Shutdown requested"),
    }

    orchestrator.stop().await
}
