//! Printer status samples.
//!
//! Devices report status as loosely-typed JSON ([`RawStatus`]). Before any
//! detector looks at a sample it is validated into a [`StatusSample`], which
//! guarantees a known discrete state and finite telemetry values.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::now_millis;

/// Discrete printer state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterState {
    Idle,
    Printing,
    Heating,
    Calibrating,
    Paused,
    Pausing,
    Busy,
    Completed,
    Cancelled,
    Error,
    Offline,
    /// A state string this build does not recognise.
    Other(String),
}

impl PrinterState {
    /// Parses a device state string.
    ///
    /// Matching is case-insensitive and accepts the aliases commonly seen
    /// across printer firmwares. Returns `None` for an empty string.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        let state = match normalized.as_str() {
            "" => return None,
            "idle" | "standby" | "ready" | "operational" => Self::Idle,
            "printing" | "running" => Self::Printing,
            "heating" | "preheating" => Self::Heating,
            "calibrating" | "leveling" => Self::Calibrating,
            "paused" => Self::Paused,
            "pausing" => Self::Pausing,
            "busy" => Self::Busy,
            "completed" | "complete" | "finished" | "finish" => Self::Completed,
            "cancelled" | "canceled" | "cancelling" => Self::Cancelled,
            "error" | "failed" | "fault" => Self::Error,
            "offline" | "disconnected" => Self::Offline,
            _ => Self::Other(normalized),
        };
        Some(state)
    }

    /// Returns true for states that belong to an in-progress job.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Printing
                | Self::Heating
                | Self::Calibrating
                | Self::Paused
                | Self::Pausing
                | Self::Busy
        )
    }

    /// Returns true while filament usage counters are meaningful.
    pub fn reports_usage(&self) -> bool {
        matches!(self, Self::Printing | Self::Paused)
    }

    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::Printing => "printing",
            Self::Heating => "heating",
            Self::Calibrating => "calibrating",
            Self::Paused => "paused",
            Self::Pausing => "pausing",
            Self::Busy => "busy",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::Offline => "offline",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for PrinterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status as reported on the wire. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawStatus {
    /// Discrete state string.
    pub state: Option<String>,
    /// Current job identifier, usually the file name.
    pub job: Option<String>,
    /// Bed temperature in degrees Celsius.
    pub bed_temp: Option<f64>,
    /// Nozzle temperature in degrees Celsius.
    pub nozzle_temp: Option<f64>,
    /// Filament consumed by the current job, in grams.
    pub filament_used_g: Option<f64>,
    /// Job progress percentage.
    pub progress: Option<f64>,
}

impl RawStatus {
    /// Creates a raw status carrying only a state string.
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: Some(state.into()),
            ..Default::default()
        }
    }

    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.job = Some(job.into());
        self
    }

    pub fn with_bed_temp(mut self, temp: f64) -> Self {
        self.bed_temp = Some(temp);
        self
    }

    pub fn with_filament_used(mut self, grams: f64) -> Self {
        self.filament_used_g = Some(grams);
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Parses a raw status from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validates the sample, stamping it with the current time.
    pub fn validate(&self) -> Result<StatusSample> {
        let state = self
            .state
            .as_deref()
            .and_then(PrinterState::parse)
            .ok_or_else(|| ProtocolError::MalformedSample("missing state".to_string()))?;

        let bed_temp = finite("bed_temp", self.bed_temp)?;
        let nozzle_temp = finite("nozzle_temp", self.nozzle_temp)?;
        let filament_used_g = finite("filament_used_g", self.filament_used_g)?;
        let progress = finite("progress", self.progress)?;

        if let Some(p) = progress {
            if !(0.0..=100.0).contains(&p) {
                return Err(ProtocolError::MalformedSample(format!(
                    "progress out of range: {}",
                    p
                )));
            }
        }
        if let Some(g) = filament_used_g {
            if g < 0.0 {
                return Err(ProtocolError::MalformedSample(format!(
                    "negative filament usage: {}",
                    g
                )));
            }
        }

        let job = self
            .job
            .as_deref()
            .map(str::trim)
            .filter(|j| !j.is_empty())
            .map(str::to_string);

        Ok(StatusSample {
            state,
            job,
            bed_temp,
            nozzle_temp,
            filament_used_g,
            progress,
            received_at: now_millis(),
        })
    }
}

fn finite(field: &str, value: Option<f64>) -> Result<Option<f64>> {
    match value {
        Some(v) if !v.is_finite() => Err(ProtocolError::MalformedSample(format!(
            "{} is not a finite number",
            field
        ))),
        other => Ok(other),
    }
}

/// A validated status sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSample {
    pub state: PrinterState,
    pub job: Option<String>,
    pub bed_temp: Option<f64>,
    pub nozzle_temp: Option<f64>,
    pub filament_used_g: Option<f64>,
    pub progress: Option<f64>,
    /// Unix milliseconds at validation time.
    pub received_at: u64,
}
