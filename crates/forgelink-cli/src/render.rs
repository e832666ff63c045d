// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Text and JSON rendering for the operator CLI.  Every renderer returns a
// String so the binary decides where it goes.

use std::fmt::Write as _;

use serde::Serialize;

use forgelink_client::{DashboardView, FieldOutcome};
use forgelink_core::error::Result;
use forgelink_core::types::{
    CameraProbeResult, MachineStatus, PrinterDescriptor, PrinterInfo, UploadProgress, UploadStage,
};

/// A printer together with something read from it.
#[derive(Serialize)]
struct Tagged<'a, T> {
    printer: &'a PrinterDescriptor,
    #[serde(flatten)]
    body: T,
}

#[derive(Serialize)]
struct StatusBody<'a> {
    status: &'a MachineStatus,
}

#[derive(Serialize)]
struct InfoBody<'a> {
    info: &'a PrinterInfo,
}

#[derive(Serialize)]
struct CameraBody<'a> {
    camera: &'a CameraProbeResult,
}

#[derive(Clone, Copy)]
pub struct Renderer {
    json: bool,
}

impl Renderer {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    pub fn printers(&self, printers: &[PrinterDescriptor]) -> Result<String> {
        if self.json {
            return Ok(serde_json::to_string_pretty(printers)?);
        }
        if printers.is_empty() {
            return Ok("No printers found.".to_owned());
        }
        let width = printers.iter().map(|p| p.name.len()).max().unwrap_or(0).max(4);
        let mut out = format!("{:<width$}  {:<15}  SERIAL", "NAME", "ADDRESS");
        for p in printers {
            let _ = write!(out, "\n{:<width$}  {:<15}  {}", p.name, p.ip_address, p.serial_number);
        }
        Ok(out)
    }

    pub fn info(&self, printer: &PrinterDescriptor, info: &PrinterInfo) -> Result<String> {
        if self.json {
            return Ok(serde_json::to_string_pretty(&Tagged {
                printer,
                body: InfoBody { info },
            })?);
        }
        let mut out = format!("{printer}");
        let _ = write!(out, "\n  Model:     {}", info.model);
        let _ = write!(out, "\n  Firmware:  {}", info.firmware_version);
        let _ = write!(out, "\n  Serial:    {}", info.serial_number);
        if let Some(mac) = &info.mac_address {
            let _ = write!(out, "\n  MAC:       {mac}");
        }
        if let Some(v) = &info.build_volume {
            let _ = write!(out, "\n  Volume:    {} x {} x {} mm", v.x, v.y, v.z);
        }
        Ok(out)
    }

    pub fn status(&self, printer: &PrinterDescriptor, status: &MachineStatus) -> Result<String> {
        if self.json {
            return Ok(serde_json::to_string_pretty(&Tagged {
                printer,
                body: StatusBody { status },
            })?);
        }
        Ok(format!("{printer}\n{}", status_lines(status)))
    }

    pub fn camera(&self, printer: &PrinterDescriptor, camera: &CameraProbeResult) -> Result<String> {
        if self.json {
            return Ok(serde_json::to_string_pretty(&Tagged {
                printer,
                body: CameraBody { camera },
            })?);
        }
        Ok(format!("{printer}\n{}", camera_line(camera)))
    }

    pub fn dashboard(&self, view: &DashboardView) -> Result<String> {
        if self.json {
            return Ok(serde_json::to_string_pretty(view)?);
        }
        let mut out = format!("{}", view.descriptor);
        match &view.status {
            FieldOutcome::Ready { value } => {
                let _ = write!(out, "\n{}", status_lines(value));
            }
            FieldOutcome::Failed { kind, message } => {
                let _ = write!(out, "\n  State:     unavailable ({kind}: {message})");
            }
        }
        let _ = write!(out, "\n{}", camera_line(&view.camera));
        let _ = write!(
            out,
            "\n  Observed:  {}",
            view.observed_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        Ok(out)
    }

    /// One progress update, or `None` when text mode has nothing to say.
    pub fn upload_progress(&self, progress: &UploadProgress, remote: &str) -> Result<Option<String>> {
        if self.json {
            return Ok(Some(serde_json::to_string(progress)?));
        }
        let line = match progress.stage {
            UploadStage::Transferring => return Ok(None),
            UploadStage::Acknowledged => {
                format!("Stored {} bytes as {remote}", progress.bytes_total)
            }
            UploadStage::PrintStarted => format!("Printing {remote}"),
        };
        Ok(Some(line))
    }
}

fn status_lines(status: &MachineStatus) -> String {
    let mut out = format!("  State:     {}", status.state.label());
    let _ = write!(
        out,
        "\n  Nozzle:    {:.1} / {:.1} °C",
        status.nozzle_temp_current, status.nozzle_temp_target
    );
    let _ = write!(
        out,
        "\n  Bed:       {:.1} / {:.1} °C",
        status.bed_temp_current, status.bed_temp_target
    );
    if status.total_layers > 0 || status.progress_percent > 0.0 {
        let _ = write!(
            out,
            "\n  Progress:  {:.1}%  layer {}/{}",
            status.progress_percent, status.current_layer, status.total_layers
        );
    }
    if let Some(file) = &status.active_file_name {
        let _ = write!(out, "\n  File:      {file}");
    }
    out
}

fn camera_line(camera: &CameraProbeResult) -> String {
    if camera.available {
        let latency = camera
            .last_latency_ms
            .map(|ms| format!(", first byte in {ms} ms"))
            .unwrap_or_default();
        format!(
            "  Camera:    up at {} (attempt {}{latency})",
            camera.stream_url, camera.attempts
        )
    } else {
        format!(
            "  Camera:    unavailable after {} attempt(s): {}",
            camera.attempts,
            camera.last_failure.as_deref().unwrap_or("no response")
        )
    }
}
