//! Device identity and status feeds.
//!
//! A [`DeviceConnector`] turns a device identity into a stream of raw status
//! samples. The feed ending means the device link is down.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use protocol::RawStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::DeviceConfig;

/// Capacity of a device status feed.
const FEED_CAPACITY: usize = 32;

/// Errors from device identity validation and connection.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid device identity: {0}")]
    InvalidIdentity(String),

    #[error("device has no status endpoint")]
    NoStatusEndpoint,

    #[error("failed to connect to device: {0}")]
    Connect(String),
}

/// Snapshot of the printer a session talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Display name.
    pub name: String,
    /// Host name or address.
    pub host: String,
    #[serde(default)]
    pub serial: Option<String>,
    /// URL polled for JSON status.
    #[serde(default)]
    pub status_url: Option<String>,
    /// URL of the camera stream.
    #[serde(default)]
    pub camera_url: Option<String>,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            serial: None,
            status_url: None,
            camera_url: None,
        }
    }

    pub fn with_status_url(mut self, url: impl Into<String>) -> Self {
        self.status_url = Some(url.into());
        self
    }

    pub fn with_camera_url(mut self, url: impl Into<String>) -> Self {
        self.camera_url = Some(url.into());
        self
    }

    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.name.trim().is_empty() {
            return Err(DeviceError::InvalidIdentity("name is empty".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(DeviceError::InvalidIdentity("host is empty".to_string()));
        }
        for (field, value) in [("status_url", &self.status_url), ("camera_url", &self.camera_url)] {
            if let Some(url) = value {
                url::Url::parse(url)
                    .map_err(|e| DeviceError::InvalidIdentity(format!("{}: {}", field, e)))?;
            }
        }
        Ok(())
    }
}

/// Opens status feeds for devices.
pub trait DeviceConnector: Send + Sync {
    /// Connects to the device. The returned feed closes when the link drops.
    fn connect<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<RawStatus>, DeviceError>>;
}

/// Polls a JSON status endpoint over HTTP.
pub struct HttpStatusConnector {
    client: reqwest::Client,
    config: DeviceConfig,
}

impl HttpStatusConnector {
    pub fn new(config: DeviceConfig) -> Result<Self, DeviceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DeviceError::Connect(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn poll(client: &reqwest::Client, url: &str) -> Result<RawStatus, DeviceError> {
        let response = client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DeviceError::Connect(e.to_string()))?;
        response
            .json::<RawStatus>()
            .await
            .map_err(|e| DeviceError::Connect(e.to_string()))
    }
}

impl DeviceConnector for HttpStatusConnector {
    fn connect<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<RawStatus>, DeviceError>> {
        Box::pin(async move {
            let url = identity
                .status_url
                .clone()
                .ok_or(DeviceError::NoStatusEndpoint)?;

            // The first poll doubles as the connection check.
            let first = Self::poll(&self.client, &url).await?;

            let (tx, rx) = mpsc::channel(FEED_CAPACITY);
            let client = self.client.clone();
            let interval = Duration::from_millis(self.config.poll_interval_ms);
            let threshold = self.config.failure_threshold.max(1);
            let name = identity.name.clone();

            tokio::spawn(async move {
                if tx.send(first).await.is_err() {
                    return;
                }
                let mut failures = 0u32;
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = tx.closed() => break,
                        _ = ticker.tick() => {}
                    }
                    match Self::poll(&client, &url).await {
                        Ok(status) => {
                            failures = 0;
                            if tx.send(status).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            failures += 1;
                            tracing::warn!(device = %name, failures, "Status poll failed: {}", e);
                            if failures >= threshold {
                                tracing::warn!(device = %name, "Device unreachable, closing feed");
                                break;
                            }
                        }
                    }
                }
            });

            Ok(rx)
        })
    }
}

/// Connector whose feeds are driven by hand.
///
/// Each successful connect replaces the sender stored for the device name.
#[derive(Default)]
pub struct ManualConnector {
    feeds: DashMap<String, mpsc::Sender<RawStatus>>,
    failing: AtomicBool,
    connects: AtomicUsize,
}

impl ManualConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender feeding the device's latest connection.
    pub fn feed(&self, name: &str) -> Option<mpsc::Sender<RawStatus>> {
        self.feeds.get(name).map(|entry| entry.value().clone())
    }

    /// Closes the device's feed, simulating a dropped link.
    pub fn disconnect(&self, name: &str) -> bool {
        self.feeds.remove(name).is_some()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl DeviceConnector for ManualConnector {
    fn connect<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<RawStatus>, DeviceError>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(DeviceError::Connect(format!("{} unreachable", identity.host)));
            }
            let (tx, rx) = mpsc::channel(FEED_CAPACITY);
            self.feeds.insert(identity.name.clone(), tx);
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(rx)
        })
    }
}
