// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// UDP discovery of FlashForge printers on the local network.
//
// A 16-byte zero probe sent to the discovery group (`225.0.0.9:19000` by
// default) makes every printer on the segment answer with a fixed-layout
// datagram carrying its machine name and serial number.  Each call binds its
// own ephemeral socket, so concurrent discoveries never see each other's
// replies.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use forgelink_core::config::DiscoveryConfig;
use forgelink_core::error::{ForgeError, Result};
use forgelink_core::types::PrinterDescriptor;

use crate::transport::{self, DatagramChannel};

/// The probe payload.
pub const PROBE: [u8; 16] = [0; 16];

/// Shortest datagram that can hold both identity fields.
pub const MIN_REPLY_LEN: usize = 0xC4;

const NAME_FIELD: std::ops::Range<usize> = 0x00..0x20;
const SERIAL_FIELD: std::ops::Range<usize> = 0x92..0xB2;

/// Printer discovery over UDP.
#[derive(Debug, Clone)]
pub struct PrinterDiscovery {
    config: DiscoveryConfig,
}

impl PrinterDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Probe the network and collect replies until `timeout` elapses.
    ///
    /// Silence is not an error: an empty list comes back.  Only failing to
    /// bind the socket or send the probe fails the call.
    #[instrument(skip(self), fields(target = %self.config.target))]
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<PrinterDescriptor>> {
        let socket = transport::bind_discovery_socket()
            .await
            .map_err(|e| ForgeError::Connection(format!("bind discovery socket: {e}")))?;
        self.discover_on(&socket, timeout).await
    }

    /// Run one discovery round over an already-bound channel.
    pub async fn discover_on<C: DatagramChannel>(
        &self,
        channel: &C,
        timeout: Duration,
    ) -> Result<Vec<PrinterDescriptor>> {
        let deadline = Instant::now() + timeout;
        let target = self.config.target;

        // More than one probe: multicast on Wi-Fi drops packets.
        for _ in 0..self.config.probe_count.max(1) {
            match tokio::time::timeout_at(deadline, channel.send_to(&PROBE, target)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    return Err(ForgeError::Connection(format!(
                        "send discovery probe to {target}: {e}"
                    )));
                }
                Err(_) => {
                    return Err(ForgeError::Timeout(format!(
                        "sending discovery probe to {target} took longer than {}ms",
                        timeout.as_millis()
                    )));
                }
            }
        }
        debug!(%target, probes = self.config.probe_count.max(1), "discovery probes sent");

        let mut found = DiscoveryBatch::default();
        let mut buf = [0u8; 1024];
        loop {
            match tokio::time::timeout_at(deadline, channel.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    warn!(error = %e, found = found.len(), "discovery receive failed, returning replies so far");
                    break;
                }
                Ok(Ok((len, source))) => match parse_discovery_reply(&buf[..len], source.ip()) {
                    Some(descriptor) => found.insert(descriptor),
                    None => debug!(%source, len, "ignoring datagram that is not a printer reply"),
                },
            }
        }

        let printers = found.into_descriptors();
        info!(count = printers.len(), "discovery finished");
        Ok(printers)
    }
}

/// Decode a discovery reply sent from `source`.
///
/// Returns `None` for anything too short or without a usable serial.
pub fn parse_discovery_reply(datagram: &[u8], source: IpAddr) -> Option<PrinterDescriptor> {
    if datagram.len() < MIN_REPLY_LEN {
        return None;
    }
    let serial = nul_padded(&datagram[SERIAL_FIELD])?;
    // A garbled name is survivable; the fallback name is used instead.
    let name = nul_padded(&datagram[NAME_FIELD]).unwrap_or_default();
    PrinterDescriptor::discovered(serial, name, source)
}

fn nul_padded(field: &[u8]) -> Option<&str> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).ok()
}

/// Replies gathered during one call, deduplicated by serial.
#[derive(Debug, Default)]
struct DiscoveryBatch {
    by_serial: HashMap<String, PrinterDescriptor>,
}

impl DiscoveryBatch {
    fn insert(&mut self, descriptor: PrinterDescriptor) {
        if let Some(previous) = self.by_serial.insert(descriptor.serial_number.clone(), descriptor) {
            debug!(serial = %previous.serial_number, "newer reply supersedes earlier one");
        }
    }

    fn len(&self) -> usize {
        self.by_serial.len()
    }

    fn into_descriptors(self) -> Vec<PrinterDescriptor> {
        let mut printers: Vec<_> = self.by_serial.into_values().collect();
        printers.sort_by(|a, b| a.serial_number.cmp(&b.serial_number));
        printers
    }
}

/// Build a reply datagram the way a printer lays it out.
#[cfg(test)]
pub(crate) fn encode_reply(name: &str, serial: &str) -> Vec<u8> {
    let mut datagram = vec![0u8; MIN_REPLY_LEN];
    datagram[NAME_FIELD.start..NAME_FIELD.start + name.len()].copy_from_slice(name.as_bytes());
    datagram[SERIAL_FIELD.start..SERIAL_FIELD.start + serial.len()]
        .copy_from_slice(serial.as_bytes());
    datagram
}
