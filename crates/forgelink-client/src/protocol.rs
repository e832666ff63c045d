// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// FlashForge control protocol: command frames, reply line classification,
// reply parsers, and file-transfer packet framing.
//
// Commands are G-code-like lines prefixed with `~` and terminated by CRLF.
// The printer answers with a `CMD <code> Received.` echo, zero or more body
// lines, and a terminating `ok` (or a line beginning with `error`).

use forgelink_core::error::{ForgeError, Result};
use forgelink_core::types::{
    BuildVolume, DeviceState, PrintProgress, PrinterInfo, TemperaturePair, Temperatures,
};

/// Marker opening every transfer packet.
pub const PACKET_MAGIC: [u8; 4] = [0x5A, 0x5A, 0xA5, 0xA5];

/// Bytes in a packet header (magic + sequence + length).
pub const PACKET_HEADER_LEN: usize = 12;

/// Body lines accepted in one reply before the frame is declared broken.
pub const MAX_REPLY_LINES: usize = 256;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A command understood by the printer's control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `M601 S1`: claim the control channel.
    TakeControl,
    /// `M602`: release the control channel.
    ReleaseControl,
    /// `M115`: identity and build volume.
    Info,
    /// `M105`: nozzle and bed temperatures.
    Temperatures,
    /// `M119`: machine state and current file.
    MachineState,
    /// `M27`: SD byte progress and layer.
    Progress,
    /// `M28`: announce a file transfer.
    BeginUpload { size: u64, remote_path: String },
    /// `M29`: close a file transfer.
    EndUpload,
    /// `M23`: select a stored file and start printing it.
    StartPrint { remote_path: String },
}

impl Command {
    /// The G-code the printer echoes back for this command.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TakeControl => "M601",
            Self::ReleaseControl => "M602",
            Self::Info => "M115",
            Self::Temperatures => "M105",
            Self::MachineState => "M119",
            Self::Progress => "M27",
            Self::BeginUpload { .. } => "M28",
            Self::EndUpload => "M29",
            Self::StartPrint { .. } => "M23",
        }
    }

    /// The exact bytes written to the wire.
    pub fn frame(&self) -> String {
        match self {
            Self::TakeControl => "~M601 S1\r\n".to_owned(),
            Self::BeginUpload { size, remote_path } => format!("~M28 {size} {remote_path}\r\n"),
            Self::StartPrint { remote_path } => format!("~M23 {remote_path}\r\n"),
            other => format!("~{}\r\n", other.code()),
        }
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// A successfully terminated reply: the body lines between the echo and `ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: &'static str,
    pub lines: Vec<String>,
}

/// What a single reply line means for framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyLine<'a> {
    /// `CMD <code> Received.`
    Echo(&'a str),
    /// Terminating `ok`.
    Ok,
    /// Terminating rejection, verbatim.
    Error(&'a str),
    Body(&'a str),
    Blank,
}

/// Classify one trimmed reply line.
pub fn classify_line(line: &str) -> ReplyLine<'_> {
    let line = line.trim();
    if line.is_empty() {
        return ReplyLine::Blank;
    }
    if line.eq_ignore_ascii_case("ok") {
        return ReplyLine::Ok;
    }
    if line.get(..5).is_some_and(|head| head.eq_ignore_ascii_case("error")) {
        return ReplyLine::Error(line);
    }
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [cmd, code, tail] if cmd.eq_ignore_ascii_case("CMD") && tail.eq_ignore_ascii_case("Received.") => {
            ReplyLine::Echo(*code)
        }
        _ => ReplyLine::Body(line),
    }
}

/// Value of the first `key: value` line whose key matches, case-insensitively.
fn field<'a>(lines: &'a [String], key: &str) -> Option<&'a str> {
    lines.iter().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        k.trim().eq_ignore_ascii_case(key).then(|| v.trim())
    })
}

/// Collapse whitespace around `:` and `/` so `T0: 205 / 210` reads as
/// `T0:205/210`.
fn compact(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space
            && !matches!(ch, ':' | '/')
            && !out.ends_with(|c: char| c == ':' || c == '/')
        {
            out.push(' ');
        }
        pending_space = false;
        out.push(ch);
    }
    out
}

fn parse_pair<T: std::str::FromStr>(raw: &str) -> Option<(T, T)> {
    let (a, b) = raw.split_once('/')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

fn missing(code: &str, what: &str) -> ForgeError {
    ForgeError::Protocol(format!("{code} reply is missing {what}"))
}

/// Parse an `M115` reply.
pub fn parse_info(reply: &Reply) -> Result<PrinterInfo> {
    let lines = &reply.lines;
    let required = |key: &str| {
        field(lines, key)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| missing("M115", key))
    };

    let model = required("Machine Type")?;
    let firmware_version = required("Firmware")?;
    let serial_number = required("SN").or_else(|_| required("Serial Number"))?;

    let optional = |key: &str| field(lines, key).filter(|v| !v.is_empty()).map(str::to_owned);

    Ok(PrinterInfo {
        name: optional("Machine Name"),
        model,
        firmware_version,
        serial_number,
        mac_address: optional("Mac Address"),
        build_volume: lines.iter().find_map(|l| parse_build_volume(l)),
    })
}

/// `X: 220 Y: 220 Z: 220`
fn parse_build_volume(line: &str) -> Option<BuildVolume> {
    let compacted = compact(line);
    let mut axes = [None; 3];
    for token in compacted.split_whitespace() {
        let (axis, value) = token.split_once(':')?;
        let slot = match axis {
            "X" | "x" => 0,
            "Y" | "y" => 1,
            "Z" | "z" => 2,
            _ => return None,
        };
        axes[slot] = value.parse::<u32>().ok();
    }
    Some(BuildVolume {
        x: axes[0]?,
        y: axes[1]?,
        z: axes[2]?,
    })
}

/// Parse an `M105` reply such as `T0:210/210 B:60/60`.
pub fn parse_temperatures(reply: &Reply) -> Result<Temperatures> {
    let mut nozzle = None;
    let mut bed = None;

    for line in &reply.lines {
        for token in compact(line).split_whitespace() {
            let Some((sensor, value)) = token.split_once(':') else {
                continue;
            };
            let target = match sensor {
                "T0" | "T" => &mut nozzle,
                "B" => &mut bed,
                _ => continue,
            };
            if target.is_some() {
                continue;
            }
            let (current, setpoint) = parse_pair::<f64>(value).ok_or_else(|| {
                ForgeError::Protocol(format!("M105 {sensor} value {value:?} is not current/target"))
            })?;
            *target = Some(TemperaturePair {
                current,
                target: setpoint,
            });
        }
    }

    Ok(Temperatures {
        nozzle: nozzle.ok_or_else(|| missing("M105", "a nozzle temperature (T0:)"))?,
        bed: bed.ok_or_else(|| missing("M105", "a bed temperature (B:)"))?,
    })
}

/// Machine state and active file from `M119`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineReport {
    pub state: DeviceState,
    /// The `MachineStatus` value as sent.
    pub raw_state: String,
    pub current_file: Option<String>,
}

/// Parse an `M119` reply.
pub fn parse_machine_state(reply: &Reply) -> Result<MachineReport> {
    let raw_state = field(&reply.lines, "MachineStatus")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing("M119", "MachineStatus"))?;
    let current_file = field(&reply.lines, "CurrentFile")
        .filter(|v| !v.is_empty())
        .map(str::to_owned);

    Ok(MachineReport {
        state: DeviceState::from_machine_status(raw_state),
        raw_state: raw_state.to_owned(),
        current_file,
    })
}

/// Parse an `M27` reply: `SD printing byte 52/100` and `Layer: 147/550`.
pub fn parse_progress(reply: &Reply) -> Result<PrintProgress> {
    let (bytes_done, bytes_total) = reply
        .lines
        .iter()
        .filter(|l| l.to_ascii_lowercase().contains("byte"))
        .find_map(|l| {
            compact(l)
                .split_whitespace()
                .rev()
                .find_map(parse_pair::<u64>)
        })
        .ok_or_else(|| missing("M27", "SD byte progress"))?;

    let (current_layer, total_layers) = field(&reply.lines, "Layer")
        .and_then(|v| parse_pair::<u32>(&compact(v)))
        .ok_or_else(|| missing("M27", "Layer"))?;

    if current_layer > total_layers {
        return Err(ForgeError::Protocol(format!(
            "M27 layer {current_layer} exceeds total {total_layers}"
        )));
    }

    Ok(PrintProgress {
        bytes_done,
        bytes_total,
        current_layer,
        total_layers,
    })
}

// ---------------------------------------------------------------------------
// Transfer packets
// ---------------------------------------------------------------------------

/// Frame one transfer packet:
/// `magic | sequence u32 LE | length u32 LE | payload | crc32 u32 LE`.
pub fn encode_packet(sequence: u32, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(PACKET_HEADER_LEN + payload.len() + 4);
    packet.extend_from_slice(&PACKET_MAGIC);
    packet.extend_from_slice(&sequence.to_le_bytes());
    packet.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    packet.extend_from_slice(payload);
    packet.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    packet
}
