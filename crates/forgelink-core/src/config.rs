// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Client configuration.
//
// Components take their settings as constructor arguments.  Only the binary
// reads the process environment, via `LinkConfig::from_env`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, Result};
use crate::types::PrinterDescriptor;

/// FlashForge control port.
pub const DEFAULT_CONTROL_PORT: u16 = 8899;

/// Multicast group and port FlashForge printers answer discovery probes on.
pub const DEFAULT_DISCOVERY_TARGET: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(225, 0, 0, 9), 19000));

/// Payload bytes per transfer packet.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Settings for every Forgelink component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Printer address override (`ip` or `ip:port`) for networks where
    /// discovery does not work.
    pub printer_addr: Option<String>,
    pub discovery: DiscoveryConfig,
    pub session: SessionTimeouts,
    pub camera: CameraConfig,
    /// Payload bytes per transfer packet.
    pub upload_chunk_size: usize,
}

/// Discovery probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub target: SocketAddr,
    /// Listen window for `list`-style discovery.
    pub timeout: Duration,
    /// Shorter window used when the dashboard auto-selects a printer.
    pub watch_timeout: Duration,
    /// Probe datagrams sent per call (tolerates packet loss).
    pub probe_count: u32,
}

/// Control session deadlines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionTimeouts {
    pub connect: Duration,
    /// Deadline for one complete reply frame.
    pub read: Duration,
}

/// Camera stream location and probe backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub port: u16,
    pub stream_path: String,
    pub snapshot_path: String,
    /// Deadline for one attempt to deliver its first byte.
    pub attempt_timeout: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap on the summed backoff waits of one probe.
    pub max_total_wait: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            printer_addr: None,
            discovery: DiscoveryConfig::default(),
            session: SessionTimeouts::default(),
            camera: CameraConfig::default(),
            upload_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_DISCOVERY_TARGET,
            timeout: Duration::from_secs(5),
            watch_timeout: Duration::from_secs(2),
            probe_count: 2,
        }
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(5),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            stream_path: "/?action=stream".into(),
            snapshot_path: "/?action=snapshot".into(),
            attempt_timeout: Duration::from_secs(3),
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_total_wait: Duration::from_secs(10),
        }
    }
}

impl LinkConfig {
    /// Defaults overridden by `FORGELINK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = lookup("FORGELINK_PRINTER_ADDR").filter(|a| !a.trim().is_empty()) {
            // Validate eagerly so a typo surfaces at startup.
            parse_printer_addr(&addr)?;
            config.printer_addr = Some(addr.trim().to_owned());
        }
        if let Some(ms) = millis(&lookup, "FORGELINK_DISCOVERY_TIMEOUT_MS")? {
            config.discovery.timeout = ms;
        }
        if let Some(ms) = millis(&lookup, "FORGELINK_CONNECT_TIMEOUT_MS")? {
            config.session.connect = ms;
        }
        if let Some(ms) = millis(&lookup, "FORGELINK_READ_TIMEOUT_MS")? {
            config.session.read = ms;
        }
        if let Some(ms) = millis(&lookup, "FORGELINK_PROBE_TIMEOUT_MS")? {
            config.camera.attempt_timeout = ms;
        }
        if let Some(raw) = lookup("FORGELINK_CAMERA_ATTEMPTS") {
            let attempts: u32 = raw.trim().parse().map_err(|e| {
                ForgeError::Config(format!("FORGELINK_CAMERA_ATTEMPTS={raw:?}: {e}"))
            })?;
            if attempts == 0 {
                return Err(ForgeError::Config(
                    "FORGELINK_CAMERA_ATTEMPTS must be at least 1".into(),
                ));
            }
            config.camera.max_attempts = attempts;
        }
        if let Some(ms) = millis(&lookup, "FORGELINK_CAMERA_BASE_DELAY_MS")? {
            config.camera.base_delay = ms;
        }
        if let Some(ms) = millis(&lookup, "FORGELINK_CAMERA_MAX_WAIT_MS")? {
            config.camera.max_total_wait = ms;
        }

        Ok(config)
    }

    /// Descriptor for the configured address override, if any.
    pub fn printer_override(&self) -> Result<Option<PrinterDescriptor>> {
        self.printer_addr
            .as_deref()
            .map(|addr| {
                let (ip, port) = parse_printer_addr(addr)?;
                Ok(PrinterDescriptor::manual(ip, port))
            })
            .transpose()
    }
}

/// Parse `ip` or `ip:port`; a bare IP gets the default control port.
pub fn parse_printer_addr(raw: &str) -> Result<(IpAddr, u16)> {
    let raw = raw.trim();
    if let Ok(sock) = raw.parse::<SocketAddr>() {
        return Ok((sock.ip(), sock.port()));
    }
    raw.parse::<IpAddr>()
        .map(|ip| (ip, DEFAULT_CONTROL_PORT))
        .map_err(|_| ForgeError::Config(format!("printer address {raw:?} is not ip or ip:port")))
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| ForgeError::Config(format!("{key}={raw:?}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = LinkConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.camera.max_attempts, 4);
        assert_eq!(config.camera.base_delay, Duration::from_millis(500));
        assert_eq!(config.discovery.target.to_string(), "225.0.0.9:19000");
        assert_eq!(config.discovery.target, DEFAULT_DISCOVERY_TARGET);
        assert_eq!(config.upload_chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.printer_addr.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = LinkConfig::from_lookup(lookup_from(&[
            ("FORGELINK_PRINTER_ADDR", "192.168.1.192"),
            ("FORGELINK_READ_TIMEOUT_MS", "750"),
            ("FORGELINK_CAMERA_ATTEMPTS", "6"),
            ("FORGELINK_CAMERA_BASE_DELAY_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.session.read, Duration::from_millis(750));
        assert_eq!(config.camera.max_attempts, 6);
        assert_eq!(config.camera.base_delay, Duration::from_millis(250));

        let printer = config.printer_override().unwrap().unwrap();
        assert_eq!(printer.control_port, DEFAULT_CONTROL_PORT);
        assert!(printer.manually_added);
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = LinkConfig::from_lookup(lookup_from(&[("FORGELINK_CONNECT_TIMEOUT_MS", "5s")]))
            .unwrap_err();
        assert!(matches!(err, ForgeError::Config(_)));
        assert!(err.to_string().contains("FORGELINK_CONNECT_TIMEOUT_MS"));
    }

    #[test]
    fn zero_camera_attempts_rejected() {
        let err = LinkConfig::from_lookup(lookup_from(&[("FORGELINK_CAMERA_ATTEMPTS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ForgeError::Config(_)));
    }

    #[test]
    fn printer_addr_with_port() {
        let (ip, port) = parse_printer_addr("10.1.2.3:9000").unwrap();
        assert_eq!(ip.to_string(), "10.1.2.3");
        assert_eq!(port, 9000);
        assert!(parse_printer_addr("printer.local").is_err());
    }
}
