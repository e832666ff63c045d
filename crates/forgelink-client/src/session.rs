// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Control session: one exclusively-owned TCP connection to a printer's
// control port.
//
// The protocol has no request ids, so replies are matched to commands purely
// by order.  The session therefore allows at most one command in flight.
// Sending while a reply is outstanding, or reading when nothing is, is
// refused with `SessionBusy` instead of risking a misaligned frame.
//
// Link failures (connect, write, read, timeout) move the session to `Failed`
// and drop the transport.  Nothing reconnects behind the caller's back.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use forgelink_core::config::SessionTimeouts;
use forgelink_core::error::{ForgeError, Result};
use forgelink_core::types::{
    ConnectionState, DeviceState, MachineStatus, PrinterDescriptor, PrinterInfo,
};

use crate::protocol::{self, Command, MAX_REPLY_LINES, Reply, ReplyLine};
use crate::transport::{self, ControlStream};

/// A control connection to one printer.
pub struct ControlSession<S = TcpStream> {
    descriptor: PrinterDescriptor,
    timeouts: SessionTimeouts,
    transport: Option<BufReader<S>>,
    state: ConnectionState,
    last_error: Option<String>,
    /// Code of the command whose reply has not been fully read.
    outstanding: Option<&'static str>,
    /// Bytes of a line still being read.  Survives a cancelled read.
    line_buf: Vec<u8>,
    /// Body lines of the outstanding reply read so far.
    partial: Vec<String>,
}

impl<S> std::fmt::Debug for ControlSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("printer", &self.descriptor.serial_number)
            .field("addr", &self.descriptor.control_addr())
            .field("state", &self.state)
            .field("outstanding", &self.outstanding)
            .finish()
    }
}

impl ControlSession<TcpStream> {
    /// Connect to the printer's control port and claim control.
    #[instrument(skip_all, fields(addr = %descriptor.control_addr()))]
    pub async fn connect(descriptor: PrinterDescriptor, timeouts: SessionTimeouts) -> Result<Self> {
        let mut session = Self::detached(descriptor, timeouts);
        session.reconnect().await?;
        Ok(session)
    }

    /// Open a fresh connection for this session.
    ///
    /// A connected session is closed first; a failed one is reset to
    /// `Disconnected`.  Either way the new attempt starts from scratch.
    pub async fn reconnect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => self.close().await,
            ConnectionState::Failed => self.transition(ConnectionState::Disconnected),
            ConnectionState::Disconnected => {}
        }

        self.transition(ConnectionState::Connecting);
        let addr = self.descriptor.control_addr();
        let stream = match transport::connect_tcp(addr, self.timeouts.connect).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(e)),
        };
        self.establish(stream).await
    }
}

impl<S: ControlStream> ControlSession<S> {
    /// Run a session over an already-open stream.
    pub async fn attach(
        descriptor: PrinterDescriptor,
        stream: S,
        timeouts: SessionTimeouts,
    ) -> Result<Self> {
        let mut session = Self::detached(descriptor, timeouts);
        session.transition(ConnectionState::Connecting);
        session.establish(stream).await?;
        Ok(session)
    }

    fn detached(descriptor: PrinterDescriptor, timeouts: SessionTimeouts) -> Self {
        Self {
            descriptor,
            timeouts,
            transport: None,
            state: ConnectionState::Disconnected,
            last_error: None,
            outstanding: None,
            line_buf: Vec::new(),
            partial: Vec::new(),
        }
    }

    /// Install `stream` and take control of the printer.
    async fn establish(&mut self, stream: S) -> Result<()> {
        self.transport = Some(BufReader::new(stream));
        self.outstanding = None;
        self.line_buf.clear();
        self.partial.clear();

        match self.exchange(&Command::TakeControl).await {
            Ok(_) => {
                self.last_error = None;
                self.transition(ConnectionState::Connected);
                info!(printer = %self.descriptor, "control session established");
                Ok(())
            }
            Err(ForgeError::RemoteRejected(detail)) => {
                // Another client holds control.
                Err(self.fail(ForgeError::RemoteRejected(detail)))
            }
            Err(e) => Err(e),
        }
    }

    pub fn descriptor(&self) -> &PrinterDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Why the session last failed.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether a command's reply has not been fully read yet.
    pub fn is_awaiting_reply(&self) -> bool {
        self.outstanding.is_some()
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {:?} -> {next:?}",
            self.state
        );
        debug!(printer = %self.descriptor.serial_number, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Record a link failure, drop the transport, and hand the error back.
    fn fail(&mut self, err: ForgeError) -> ForgeError {
        warn!(printer = %self.descriptor.serial_number, error = %err, "control session failed");
        self.transport = None;
        self.outstanding = None;
        self.line_buf.clear();
        self.partial.clear();
        self.last_error = Some(err.to_string());
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.transition(ConnectionState::Failed);
        }
        err
    }

    fn not_connected(&self) -> ForgeError {
        match &self.last_error {
            Some(cause) => ForgeError::Connection(format!(
                "session is {:?} (last error: {cause})",
                self.state
            )),
            None => ForgeError::Connection(format!("session is {:?}", self.state)),
        }
    }

    /// Write one command frame.  Its reply must be read with
    /// [`receive_reply`](Self::receive_reply) before anything else is sent.
    pub async fn send_command(&mut self, command: &Command) -> Result<()> {
        if let Some(pending) = self.outstanding {
            return Err(ForgeError::SessionBusy(format!(
                "cannot send {} while the reply to {pending} is outstanding",
                command.code()
            )));
        }
        if self.transport.is_none() {
            return Err(self.not_connected());
        }

        // Marked before writing: a write cancelled halfway still leaves the
        // link in an unknown position.
        self.outstanding = Some(command.code());
        self.partial.clear();
        let frame = command.frame();
        debug!(command = %frame.trim_end(), "send");
        self.write_all(frame.as_bytes(), command.code()).await
    }

    /// Write raw bytes (transfer packets) with no reply expected.
    pub(crate) async fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(pending) = self.outstanding {
            return Err(ForgeError::SessionBusy(format!(
                "cannot stream file data while the reply to {pending} is outstanding"
            )));
        }
        if self.transport.is_none() {
            return Err(self.not_connected());
        }
        self.write_all(bytes, "file data").await
    }

    async fn write_all(&mut self, bytes: &[u8], what: &str) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(self.not_connected());
        };
        let stream = transport.get_mut();
        let write = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        match tokio::time::timeout(self.timeouts.read, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.fail(ForgeError::Connection(format!("writing {what}: {e}")))),
            Err(_) => Err(self.fail(ForgeError::Timeout(format!(
                "writing {what} took longer than {}ms",
                self.timeouts.read.as_millis()
            )))),
        }
    }

    /// Read the reply to the outstanding command.
    ///
    /// Safe to call again after a cancelled read: whatever was already
    /// consumed is kept and the read resumes where it stopped.
    pub async fn receive_reply(&mut self) -> Result<Reply> {
        let Some(code) = self.outstanding else {
            return Err(ForgeError::SessionBusy(
                "no command is awaiting a reply".into(),
            ));
        };
        let deadline = Instant::now() + self.timeouts.read;

        loop {
            let Some(transport) = self.transport.as_mut() else {
                return Err(self.not_connected());
            };
            let read = tokio::time::timeout_at(
                deadline,
                transport.read_until(b'\n', &mut self.line_buf),
            )
            .await;

            match read {
                Err(_) => {
                    return Err(self.fail(ForgeError::Timeout(format!(
                        "no complete reply to {code} within {}ms",
                        self.timeouts.read.as_millis()
                    ))));
                }
                Ok(Err(e)) => {
                    return Err(self.fail(ForgeError::Connection(format!(
                        "reading reply to {code}: {e}"
                    ))));
                }
                Ok(Ok(0)) => {
                    return Err(self.fail(ForgeError::Connection(format!(
                        "printer closed the connection before answering {code}"
                    ))));
                }
                Ok(Ok(_)) => {}
            }
            if !self.line_buf.ends_with(b"\n") {
                // Stream ended mid-line; the next read reports the EOF.
                continue;
            }

            let line = String::from_utf8_lossy(&self.line_buf).trim().to_owned();
            self.line_buf.clear();

            match protocol::classify_line(&line) {
                ReplyLine::Blank => {}
                ReplyLine::Echo(echoed) if echoed.eq_ignore_ascii_case(code) => {}
                ReplyLine::Echo(echoed) => {
                    return Err(self.fail(ForgeError::Protocol(format!(
                        "expected the reply to {code}, got one for {echoed}"
                    ))));
                }
                ReplyLine::Body(text) => {
                    if self.partial.len() >= MAX_REPLY_LINES {
                        return Err(self.fail(ForgeError::Protocol(format!(
                            "reply to {code} exceeds {MAX_REPLY_LINES} lines"
                        ))));
                    }
                    self.partial.push(text.to_owned());
                }
                ReplyLine::Ok => {
                    self.outstanding = None;
                    let lines = std::mem::take(&mut self.partial);
                    debug!(%code, lines = lines.len(), "reply");
                    return Ok(Reply { code, lines });
                }
                ReplyLine::Error(text) => {
                    self.outstanding = None;
                    let mut lines = std::mem::take(&mut self.partial);
                    lines.push(text.to_owned());
                    let detail = lines.join("; ");
                    warn!(%code, %detail, "printer rejected command");
                    return Err(ForgeError::RemoteRejected(detail));
                }
            }
        }
    }

    /// Send a command and read its reply.
    pub async fn exchange(&mut self, command: &Command) -> Result<Reply> {
        self.send_command(command).await?;
        self.receive_reply().await
    }

    /// Identity and build volume (`M115`).
    #[instrument(skip(self), fields(printer = %self.descriptor.serial_number))]
    pub async fn info(&mut self) -> Result<PrinterInfo> {
        let reply = self.exchange(&Command::Info).await?;
        protocol::parse_info(&reply)
    }

    /// Poll a fresh machine snapshot.
    ///
    /// Reads state (`M119`) and temperatures (`M105`); job progress (`M27`)
    /// is only requested while printing.
    #[instrument(skip(self), fields(printer = %self.descriptor.serial_number))]
    pub async fn status(&mut self) -> Result<MachineStatus> {
        let report = protocol::parse_machine_state(&self.exchange(&Command::MachineState).await?)?;
        if report.state == DeviceState::Unknown {
            warn!(raw = %report.raw_state, "unrecognised machine state");
        }

        let temperatures = protocol::parse_temperatures(&self.exchange(&Command::Temperatures).await?)?;

        let progress = if report.state == DeviceState::Printing {
            Some(protocol::parse_progress(&self.exchange(&Command::Progress).await?)?)
        } else {
            None
        };

        let status = MachineStatus::new(report.state, temperatures, progress, report.current_file);
        debug!(state = status.state.label(), progress = status.progress_percent, "status polled");
        Ok(status)
    }

    /// Mark the link unusable after an aborted transfer.
    pub(crate) fn abandon(&mut self, reason: &str) {
        if self.transport.is_some() {
            let _ = self.fail(ForgeError::Upload(reason.to_owned()));
        }
    }

    /// Release control and close the connection.  Calling it again is a
    /// no-op.
    pub async fn close(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            // A connect cancelled before the socket opened leaves Connecting
            // with no transport.
            if self.state == ConnectionState::Connecting {
                self.last_error = Some("connection attempt abandoned".into());
                self.transition(ConnectionState::Failed);
            }
            if self.state == ConnectionState::Failed {
                self.transition(ConnectionState::Disconnected);
            }
            return;
        };

        if self.state == ConnectionState::Connected && self.outstanding.is_none() {
            let bye = Command::ReleaseControl.frame();
            let stream = transport.get_mut();
            let release = async {
                stream.write_all(bye.as_bytes()).await?;
                stream.flush().await
            };
            if let Err(e) = tokio::time::timeout(self.timeouts.read, release)
                .await
                .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
            {
                debug!(error = %e, "release control failed, closing anyway");
            }
        }
        let _ = tokio::time::timeout(self.timeouts.read, transport.get_mut().shutdown()).await;

        self.outstanding = None;
        self.line_buf.clear();
        self.partial.clear();
        if self.state == ConnectionState::Connecting {
            self.last_error = Some("connection attempt abandoned".into());
            self.transition(ConnectionState::Failed);
        }
        self.transition(ConnectionState::Disconnected);
        info!(printer = %self.descriptor.serial_number, "control session closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testkit::{FakeLog, FakePrinter, descriptor, quick_timeouts};

    type FakeSession = ControlSession<tokio::io::DuplexStream>;

    async fn attach(printer: FakePrinter) -> (FakeSession, tokio::task::JoinHandle<FakeLog>) {
        let (stream, log) = printer.spawn();
        let session = ControlSession::attach(descriptor(), stream, quick_timeouts())
            .await
            .unwrap();
        (session, log)
    }

    #[tokio::test]
    async fn attach_takes_control() {
        let (mut session, log) = attach(FakePrinter::idle()).await;
        assert_eq!(session.state(), ConnectionState::Connected);
        session.close().await;
        let log = log.await.unwrap();
        assert_eq!(log.commands[0], "M601 S1");
        assert_eq!(log.codes().last(), Some(&"M602"));
    }

    #[tokio::test]
    async fn status_while_printing_reads_progress() {
        let (mut session, log) = attach(FakePrinter::printing()).await;
        let status = session.status().await.unwrap();

        assert_eq!(status.state, DeviceState::Printing);
        assert_eq!(status.nozzle_temp_current, 210.0);
        assert_eq!(status.bed_temp_target, 60.0);
        assert_eq!(status.progress_percent, 52.0);
        assert_eq!(status.current_layer, 147);
        assert_eq!(status.total_layers, 550);
        assert_eq!(status.active_file_name.as_deref(), Some("benchy.gx"));

        session.close().await;
        let log = log.await.unwrap();
        assert_eq!(log.codes(), vec!["M601", "M119", "M105", "M27", "M602"]);
    }

    #[tokio::test]
    async fn idle_status_skips_progress() {
        let (mut session, log) = attach(FakePrinter::idle()).await;
        let status = session.status().await.unwrap();
        assert_eq!(status.state, DeviceState::Idle);
        assert_eq!(status.progress_percent, 0.0);
        assert!(status.active_file_name.is_none());

        session.close().await;
        assert!(!log.await.unwrap().codes().contains(&"M27"));
    }

    #[tokio::test]
    async fn info_reports_identity() {
        let (mut session, _log) = attach(FakePrinter::idle()).await;
        let info = session.info().await.unwrap();
        assert_eq!(info.serial_number, "SNADVA5M0042");
        assert_eq!(info.model, "Flashforge Adventurer 5M");
    }

    #[tokio::test]
    async fn missing_field_is_protocol_error_and_session_survives() {
        let (mut session, _log) =
            attach(FakePrinter::idle().answer("M119", &["MoveMode: READY"])).await;
        let err = session.status().await.unwrap_err();
        assert!(matches!(err, ForgeError::Protocol(_)), "got {err:?}");
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(session.info().await.is_ok());
    }

    #[tokio::test]
    async fn silent_printer_times_out_and_fails_session() {
        let (mut session, _log) = attach(FakePrinter::idle().silent("M119")).await;
        let err = session.status().await.unwrap_err();
        assert!(matches!(err, ForgeError::Timeout(_)), "got {err:?}");
        assert_eq!(session.state(), ConnectionState::Failed);
        assert!(session.last_error().is_some());

        // No silent recovery.
        let again = session.info().await.unwrap_err();
        assert!(matches!(again, ForgeError::Connection(_)));
    }

    #[tokio::test]
    async fn hang_up_is_a_connection_error() {
        let (mut session, _log) = attach(FakePrinter::idle().hang_up_on("M105")).await;
        let err = session.status().await.unwrap_err();
        assert!(matches!(err, ForgeError::Connection(_)), "got {err:?}");
        assert_eq!(session.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn second_send_while_awaiting_reply_is_busy() {
        let (mut session, _log) = attach(FakePrinter::idle().silent("M119")).await;
        session.send_command(&Command::MachineState).await.unwrap();

        let err = session.send_command(&Command::Temperatures).await.unwrap_err();
        assert!(matches!(err, ForgeError::SessionBusy(_)));
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(session.is_awaiting_reply());
    }

    #[tokio::test]
    async fn receive_without_command_is_busy() {
        let (mut session, _log) = attach(FakePrinter::idle()).await;
        let err = session.receive_reply().await.unwrap_err();
        assert!(matches!(err, ForgeError::SessionBusy(_)));
    }

    #[tokio::test]
    async fn cancelled_exchange_keeps_reply_outstanding() {
        let (stream, _log) = FakePrinter::idle().silent("M119").spawn();
        let timeouts = SessionTimeouts {
            read: Duration::from_secs(5),
            ..quick_timeouts()
        };
        let mut session = ControlSession::attach(descriptor(), stream, timeouts)
            .await
            .unwrap();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), session.exchange(&Command::MachineState)).await;
        assert!(cancelled.is_err());

        let err = session.send_command(&Command::Temperatures).await.unwrap_err();
        assert!(matches!(err, ForgeError::SessionBusy(_)));
    }

    #[tokio::test]
    async fn misaligned_echo_is_protocol_error() {
        let (mut session, _log) = attach(
            FakePrinter::idle().raw("M105", "CMD M119 Received.\r\nMachineStatus: READY\r\nok\r\n"),
        )
        .await;
        let err = session
            .exchange(&Command::Temperatures)
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Protocol(_)), "got {err:?}");
        assert_eq!(session.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn device_error_is_remote_rejected_verbatim() {
        let (mut session, _log) =
            attach(FakePrinter::idle().reject("M23", "Error: file not found")).await;
        let err = session
            .exchange(&Command::StartPrint {
                remote_path: "0:/user/missing.gx".into(),
            })
            .await
            .unwrap_err();
        match err {
            ForgeError::RemoteRejected(detail) => assert!(detail.contains("Error: file not found")),
            other => panic!("expected RemoteRejected, got {other:?}"),
        }
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn refused_control_fails_attach() {
        let (stream, _log) = FakePrinter::idle()
            .reject("M601", "Error: control by other client")
            .spawn();
        let err = ControlSession::attach(descriptor(), stream, quick_timeouts())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::RemoteRejected(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut session, _log) = attach(FakePrinter::idle()).await;
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn cancelled_connect_is_reset_by_close_and_reconnect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let (mut printer, _log) = FakePrinter::idle().spawn();
                tokio::spawn(async move {
                    let _ = tokio::io::copy_bidirectional(&mut socket, &mut printer).await;
                });
            }
        });
        let target = PrinterDescriptor::manual(addr.ip(), addr.port());

        // Where a reconnect cancelled inside the TCP connect leaves things.
        let mut session = ControlSession::<TcpStream>::detached(target.clone(), quick_timeouts());
        session.transition(ConnectionState::Connecting);
        session.close().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.last_error(), Some("connection attempt abandoned"));

        let mut session = ControlSession::<TcpStream>::detached(target, quick_timeouts());
        session.transition(ConnectionState::Connecting);
        session.reconnect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        session.close().await;
    }

    #[tokio::test]
    async fn connect_to_unreachable_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = PrinterDescriptor::manual("127.0.0.1".parse().unwrap(), port);
        let err = ControlSession::connect(target, quick_timeouts())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Connection(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn connect_over_tcp_and_reconnect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let (mut printer, _log) = FakePrinter::idle().spawn();
                tokio::spawn(async move {
                    let _ = tokio::io::copy_bidirectional(&mut socket, &mut printer).await;
                });
            }
        });

        let target = PrinterDescriptor::manual(addr.ip(), addr.port());
        let mut session = ControlSession::connect(target, quick_timeouts()).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);

        session.reconnect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.status().await.unwrap().state, DeviceState::Idle);
        session.close().await;
    }
}
