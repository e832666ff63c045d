// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scripted in-memory printer used by the session, upload, and dashboard tests.

use std::collections::HashMap;
use std::net::IpAddr;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use forgelink_core::config::SessionTimeouts;
use forgelink_core::types::PrinterDescriptor;

use crate::protocol::{PACKET_HEADER_LEN, PACKET_MAGIC};

#[derive(Debug, Clone)]
enum Script {
    Answer { text: String, accepted: bool },
    Silent,
    HangUp,
}

/// Everything the fake printer saw.
#[derive(Debug, Default)]
pub(crate) struct FakeLog {
    /// Command lines without the leading `~`.
    pub commands: Vec<String>,
    pub payload: Vec<u8>,
    pub packets: u32,
    /// Packets with a wrong magic, sequence, or checksum.
    pub bad_packets: u32,
}

impl FakeLog {
    pub fn codes(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| c.split_whitespace().next())
            .collect()
    }
}

pub(crate) struct FakePrinter {
    scripts: HashMap<String, Script>,
    hang_up_after_payload: Option<usize>,
}

impl FakePrinter {
    /// A printer sitting idle with a cold hot-end.
    pub fn idle() -> Self {
        Self {
            scripts: HashMap::new(),
            hang_up_after_payload: None,
        }
        .answer("M601", &["Control Success."])
        .answer(
            "M115",
            &[
                "Machine Type: Flashforge Adventurer 5M",
                "Machine Name: Workshop",
                "Firmware: v2.7.5",
                "SN: SNADVA5M0042",
                "X: 220 Y: 220 Z: 220",
                "Tool Count: 1",
                "Mac Address:88:A9:A7:90:12:34",
            ],
        )
        .answer("M105", &["T0:25/0 T1:0/0 B:24/0"])
        .answer(
            "M119",
            &[
                "Endstop: X-max:0 Y-max:0 Z-min:0",
                "MachineStatus: READY",
                "MoveMode: READY",
                "Status: S:1 L:0 J:0 F:0",
                "LED: 1",
                "CurrentFile:",
            ],
        )
        .answer("M27", &["SD printing byte 0/100", "Layer: 0/0"])
        .answer("M28", &["Writing to file: 0:/user/upload.gx"])
        .answer("M29", &["Done saving file."])
        .answer("M23", &["File opened: upload.gx", "File selected"])
    }

    /// A printer halfway through a job.
    pub fn printing() -> Self {
        Self::idle()
            .answer(
                "M119",
                &["MachineStatus: BUILDING_FROM_SD", "CurrentFile: benchy.gx"],
            )
            .answer("M105", &["T0:210/210 B:60/60"])
            .answer("M27", &["SD printing byte 52/100", "Layer: 147/550"])
    }

    pub fn answer(mut self, code: &str, body: &[&str]) -> Self {
        let mut text = format!("CMD {code} Received.\r\n");
        for line in body {
            text.push_str(line);
            text.push_str("\r\n");
        }
        text.push_str("ok\r\n");
        self.scripts
            .insert(code.to_owned(), Script::Answer { text, accepted: true });
        self
    }

    /// Reply with exactly `text`.
    pub fn raw(mut self, code: &str, text: &str) -> Self {
        self.scripts.insert(
            code.to_owned(),
            Script::Answer {
                text: text.to_owned(),
                accepted: true,
            },
        );
        self
    }

    pub fn reject(mut self, code: &str, error_line: &str) -> Self {
        let text = format!("CMD {code} Received.\r\n{error_line}\r\n");
        self.scripts.insert(
            code.to_owned(),
            Script::Answer {
                text,
                accepted: false,
            },
        );
        self
    }

    /// Read the command and never answer.
    pub fn silent(mut self, code: &str) -> Self {
        self.scripts.insert(code.to_owned(), Script::Silent);
        self
    }

    /// Drop the connection when `code` arrives.
    pub fn hang_up_on(mut self, code: &str) -> Self {
        self.scripts.insert(code.to_owned(), Script::HangUp);
        self
    }

    /// Drop the connection once this many payload bytes have arrived.
    pub fn hang_up_after_payload(mut self, bytes: usize) -> Self {
        self.hang_up_after_payload = Some(bytes);
        self
    }

    /// Start serving; the log is returned once the client hangs up.
    pub fn spawn(self) -> (DuplexStream, JoinHandle<FakeLog>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (client, tokio::spawn(self.serve(server)))
    }

    async fn serve(self, stream: DuplexStream) -> FakeLog {
        let mut stream = BufReader::new(stream);
        let mut log = FakeLog::default();
        loop {
            let mut line = String::new();
            match stream.read_line(&mut line).await {
                Ok(0) | Err(_) => return log,
                Ok(_) => {}
            }
            let Some(command) = line.trim().strip_prefix('~') else {
                continue;
            };
            let command = command.to_owned();
            let code = command.split_whitespace().next().unwrap_or_default().to_owned();
            log.commands.push(command.clone());

            match self.scripts.get(&code) {
                None | Some(Script::Silent) => continue,
                Some(Script::HangUp) => return log,
                Some(Script::Answer { text, accepted }) => {
                    if stream.get_mut().write_all(text.as_bytes()).await.is_err() {
                        return log;
                    }
                    if code == "M28" && *accepted {
                        let size = command
                            .split_whitespace()
                            .nth(1)
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(0);
                        if !self.receive_payload(&mut stream, size, &mut log).await {
                            return log;
                        }
                    }
                }
            }
        }
    }

    /// Read transfer packets until `size` bytes arrived.  `false` means hang up.
    async fn receive_payload(
        &self,
        stream: &mut BufReader<DuplexStream>,
        size: usize,
        log: &mut FakeLog,
    ) -> bool {
        let start = log.payload.len();
        let mut sequence = 0u32;
        while log.payload.len() - start < size {
            if self
                .hang_up_after_payload
                .is_some_and(|limit| log.payload.len() - start >= limit)
            {
                return false;
            }
            let mut header = [0u8; PACKET_HEADER_LEN];
            if stream.read_exact(&mut header).await.is_err() {
                return false;
            }
            if header[..4] != PACKET_MAGIC {
                log.bad_packets += 1;
                return false;
            }
            let seq = u32::from_le_bytes(header[4..8].try_into().unwrap());
            let len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
            let mut body = vec![0u8; len + 4];
            if stream.read_exact(&mut body).await.is_err() {
                return false;
            }
            let (data, crc) = body.split_at(len);
            if seq != sequence || crc32fast::hash(data).to_le_bytes() != crc {
                log.bad_packets += 1;
            }
            sequence += 1;
            log.packets += 1;
            log.payload.extend_from_slice(data);
        }
        true
    }
}

pub(crate) fn descriptor() -> PrinterDescriptor {
    let ip: IpAddr = "192.168.1.40".parse().unwrap();
    PrinterDescriptor::discovered("SNADVA5M0042", "Adventurer5M", ip).unwrap()
}

pub(crate) fn quick_timeouts() -> SessionTimeouts {
    SessionTimeouts {
        connect: std::time::Duration::from_millis(500),
        read: std::time::Duration::from_millis(200),
    }
}
