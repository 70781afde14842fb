//! IPC client for communicating with the daemon via Unix Domain Sockets.
//!
//! The client connects to the daemon's Unix socket and sends commands,
//! receiving responses in a request-response pattern.

use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::NotificationSettings;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;
use crate::device::DeviceIdentity;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    /// This typically indicates that the daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the daemon with a custom timeout applied to every operation.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request to the daemon and wait for a response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn send_internal(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Returns `true` if the daemon answers with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    pub async fn list_sessions(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ListSessions).await
    }

    pub async fn create_session(&mut self, identity: DeviceIdentity) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::CreateSession { identity }).await
    }

    pub async fn switch_active(&mut self, session_id: String) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::SwitchActive { session_id }).await
    }

    pub async fn remove_session(&mut self, session_id: String) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::RemoveSession { session_id }).await
    }

    pub async fn set_keepalive(
        &mut self,
        session_id: String,
        enabled: bool,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::SetKeepalive { session_id, enabled })
            .await
    }

    pub async fn reassign_stream_url(
        &mut self,
        session_id: String,
        url: String,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ReassignStreamUrl { session_id, url })
            .await
    }

    pub async fn update_notification_settings(
        &mut self,
        settings: NotificationSettings,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::UpdateNotificationSettings { settings })
            .await
    }
}

fn timed_out(message: &'static str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, message))
}
