// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Forgelink printer client.

use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DEFAULT_CONTROL_PORT;

/// Unique identifier for an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification of errors for the caller's retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Network blip or timeout; the caller may retry.
    Transient,
    /// The operator must act (pick a printer, free storage, fix config).
    UserAction,
    /// Retrying unchanged cannot help.
    Permanent,
}

/// A FlashForge printer reachable on the local network.
///
/// Descriptors are never mutated once created.  A fresher discovery reply or
/// an `M115` info reply produces a new descriptor that supersedes the old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterDescriptor {
    /// Stable identifier; never empty.
    pub serial_number: String,
    pub name: String,
    pub ip_address: IpAddr,
    /// Firmware-reported model name, once known.
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub control_port: u16,
    pub discovered_at: DateTime<Utc>,
    /// Built from an address override rather than a discovery reply.
    pub manually_added: bool,
}

impl PrinterDescriptor {
    /// Descriptor for a discovery reply.  Returns `None` for an empty serial.
    pub fn discovered(serial_number: &str, name: &str, ip_address: IpAddr) -> Option<Self> {
        let serial_number = serial_number.trim();
        if serial_number.is_empty() {
            return None;
        }
        let name = match name.trim() {
            "" => format!("FlashForge@{ip_address}"),
            n => n.to_owned(),
        };
        Some(Self {
            serial_number: serial_number.to_owned(),
            name,
            ip_address,
            model: None,
            firmware_version: None,
            control_port: DEFAULT_CONTROL_PORT,
            discovered_at: Utc::now(),
            manually_added: false,
        })
    }

    /// Descriptor for a printer addressed directly (non-discoverable networks).
    ///
    /// The serial is a placeholder derived from the address until
    /// [`with_info`](Self::with_info) supplies the real one.
    pub fn manual(ip_address: IpAddr, control_port: u16) -> Self {
        Self {
            serial_number: format!("manual:{ip_address}:{control_port}"),
            name: format!("FlashForge@{ip_address}"),
            ip_address,
            model: None,
            firmware_version: None,
            control_port,
            discovered_at: Utc::now(),
            manually_added: true,
        }
    }

    /// A superseding descriptor carrying the identity reported by `M115`.
    pub fn with_info(&self, info: &PrinterInfo) -> Self {
        Self {
            serial_number: info.serial_number.clone(),
            name: info.name.clone().unwrap_or_else(|| self.name.clone()),
            model: Some(info.model.clone()),
            firmware_version: Some(info.firmware_version.clone()),
            discovered_at: Utc::now(),
            ..self.clone()
        }
    }

    /// `ip:port` of the control channel.
    pub fn control_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip_address, self.control_port)
    }
}

impl std::fmt::Display for PrinterDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.model {
            Some(model) => write!(f, "{} ({model}) at {}", self.name, self.ip_address),
            None => write!(f, "{} at {}", self.name, self.ip_address),
        }
    }
}

/// Identity and capabilities reported by `M115`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterInfo {
    pub name: Option<String>,
    pub model: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub mac_address: Option<String>,
    pub build_volume: Option<BuildVolume>,
}

/// Printable volume in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildVolume {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Machine state as reported by `M119`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Idle,
    Printing,
    Paused,
    Error,
    /// Reported, but not a value we recognise.
    Unknown,
}

impl DeviceState {
    /// Map a `MachineStatus:` value onto a state.
    pub fn from_machine_status(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "READY" | "IDLE" => Self::Idle,
            "BUILDING_FROM_SD" | "BUILDING" | "PRINTING" => Self::Printing,
            "PAUSED" | "PAUSE" => Self::Paused,
            "ERROR" | "FAULT" => Self::Error,
            _ => Self::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Printing => "printing",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// A current/target temperature pair in °C.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperaturePair {
    pub current: f64,
    pub target: f64,
}

/// Temperatures reported by `M105`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Temperatures {
    pub nozzle: TemperaturePair,
    pub bed: TemperaturePair,
}

/// Job progress reported by `M27`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub current_layer: u32,
    pub total_layers: u32,
}

impl PrintProgress {
    /// Percentage complete, clamped to [0, 100] and rounded to one decimal.
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        let raw = self.bytes_done as f64 / self.bytes_total as f64 * 100.0;
        (raw.clamp(0.0, 100.0) * 10.0).round() / 10.0
    }
}

/// Point-in-time snapshot of a printer, created fresh on every poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub state: DeviceState,
    pub nozzle_temp_current: f64,
    pub nozzle_temp_target: f64,
    pub bed_temp_current: f64,
    pub bed_temp_target: f64,
    pub progress_percent: f64,
    pub current_layer: u32,
    pub total_layers: u32,
    pub active_file_name: Option<String>,
    pub polled_at: DateTime<Utc>,
}

impl MachineStatus {
    /// Assemble a snapshot.  Progress is only carried while printing; any
    /// other state reports zero progress and layers.
    pub fn new(
        state: DeviceState,
        temperatures: Temperatures,
        progress: Option<PrintProgress>,
        active_file_name: Option<String>,
    ) -> Self {
        let (progress_percent, current_layer, total_layers) = match (state, progress) {
            (DeviceState::Printing, Some(p)) => (p.percent(), p.current_layer, p.total_layers),
            _ => (0.0, 0, 0),
        };
        Self {
            state,
            nozzle_temp_current: temperatures.nozzle.current,
            nozzle_temp_target: temperatures.nozzle.target,
            bed_temp_current: temperatures.bed.current,
            bed_temp_target: temperatures.bed.target,
            progress_percent,
            current_layer,
            total_layers,
            active_file_name,
            polled_at: Utc::now(),
        }
    }
}

/// Lifecycle of a control session's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    /// Whether `self → next` is a legal transition.
    ///
    /// Reconnecting always passes through `Disconnected → Connecting`; a
    /// `Failed` session is never revived in place.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected) | (Connecting, Failed) => true,
            (Connected, Disconnected) | (Connected, Failed) => true,
            (Failed, Disconnected) => true,
            (Disconnected, _) | (Connecting, _) | (Connected, _) | (Failed, _) => false,
        }
    }
}

/// Outcome of a camera stream availability check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraProbeResult {
    pub stream_url: String,
    pub snapshot_url: String,
    pub available: bool,
    pub attempts: u32,
    /// Time to first byte of the successful attempt.
    pub last_latency_ms: Option<u64>,
    /// Why the last failed attempt failed.
    pub last_failure: Option<String>,
}

/// One file transfer plus optional auto-start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJob {
    pub id: JobId,
    pub local_path: PathBuf,
    pub remote_file_name: String,
    pub start_after_upload: bool,
    pub bytes_total: u64,
    pub bytes_sent: u64,
}

impl UploadJob {
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_file_name: impl Into<String>,
        start_after_upload: bool,
        bytes_total: u64,
    ) -> Self {
        Self {
            id: JobId::new(),
            local_path: local_path.into(),
            remote_file_name: remote_file_name.into(),
            start_after_upload,
            bytes_total,
            bytes_sent: 0,
        }
    }

    /// Device-side path the file is stored under.
    pub fn remote_path(&self) -> String {
        format!("0:/user/{}", self.remote_file_name)
    }
}

/// Where an upload stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStage {
    /// A chunk left this host.
    Transferring,
    /// The printer acknowledged the complete file.
    Acknowledged,
    /// The printer accepted the start-print command.
    PrintStarted,
}

/// One progress update emitted by an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub job_id: JobId,
    pub bytes_sent: u64,
    pub bytes_total: u64,
    pub stage: UploadStage,
}
