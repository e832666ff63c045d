// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Dashboard aggregator: one combined view of a printer's status and camera.
//
// The status read and the camera probe are independent, so they run
// concurrently and each reports its own outcome.  A printer that answers on
// the control port but has no camera (or the reverse) still produces a view.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{info, instrument, warn};

use forgelink_core::config::SessionTimeouts;
use forgelink_core::error::{ForgeError, Result};
use forgelink_core::types::{CameraProbeResult, MachineStatus, PrinterDescriptor, PrinterInfo};

use crate::camera::{CameraChecker, StreamProbe};
use crate::discovery::PrinterDiscovery;
use crate::session::ControlSession;
use crate::transport::ControlStream;

/// Finds printers on the network.
pub trait PrinterLocator: Send + Sync {
    fn locate(&self, timeout: Duration) -> impl Future<Output = Result<Vec<PrinterDescriptor>>> + Send;
}

impl PrinterLocator for PrinterDiscovery {
    fn locate(&self, timeout: Duration) -> impl Future<Output = Result<Vec<PrinterDescriptor>>> + Send {
        self.discover(timeout)
    }
}

/// Opens control sessions.
pub trait SessionOpener: Send + Sync {
    type Stream: ControlStream;

    fn open(
        &self,
        descriptor: &PrinterDescriptor,
    ) -> impl Future<Output = Result<ControlSession<Self::Stream>>> + Send;
}

/// Opens sessions over TCP.
#[derive(Debug, Clone, Copy)]
pub struct TcpSessionOpener {
    pub timeouts: SessionTimeouts,
}

impl SessionOpener for TcpSessionOpener {
    type Stream = TcpStream;

    fn open(
        &self,
        descriptor: &PrinterDescriptor,
    ) -> impl Future<Output = Result<ControlSession<TcpStream>>> + Send {
        ControlSession::connect(descriptor.clone(), self.timeouts)
    }
}

/// `target` if given, otherwise the single printer `locator` finds.
///
/// Zero printers is `NoDeviceFound`; more than one is `AmbiguousDevice`
/// listing every candidate.
pub async fn resolve_target<L: PrinterLocator>(
    locator: &L,
    target: Option<PrinterDescriptor>,
    timeout: Duration,
) -> Result<PrinterDescriptor> {
    if let Some(descriptor) = target {
        return Ok(descriptor);
    }
    let mut found = locator.locate(timeout).await?;
    match found.len() {
        0 => Err(ForgeError::NoDeviceFound),
        1 => Ok(found.remove(0)),
        _ => Err(ForgeError::AmbiguousDevice {
            candidates: found
                .iter()
                .map(|d| format!("{d} [{}]", d.serial_number))
                .collect(),
        }),
    }
}

/// One field of the view: either a value or why it is missing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FieldOutcome<T> {
    Ready { value: T },
    Failed { kind: String, message: String },
}

impl<T> FieldOutcome<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Ready { value } => Some(value),
            Self::Failed { .. } => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

impl<T> From<&ForgeError> for FieldOutcome<T> {
    fn from(err: &ForgeError) -> Self {
        Self::Failed {
            kind: err.kind().to_owned(),
            message: err.to_string(),
        }
    }
}

impl<T> From<Result<T>> for FieldOutcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Ready { value },
            Err(err) => Self::from(&err),
        }
    }
}

/// Everything known about one printer at one moment.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub descriptor: PrinterDescriptor,
    pub status: FieldOutcome<MachineStatus>,
    pub camera: CameraProbeResult,
    pub observed_at: DateTime<Utc>,
}

/// Combines discovery, a status read, and a camera probe.
pub struct Dashboard<L, O, P> {
    locator: L,
    opener: O,
    camera: CameraChecker<P>,
    discovery_timeout: Duration,
}

impl<L: PrinterLocator, O: SessionOpener, P: StreamProbe> Dashboard<L, O, P> {
    pub fn new(locator: L, opener: O, camera: CameraChecker<P>, discovery_timeout: Duration) -> Self {
        Self {
            locator,
            opener,
            camera,
            discovery_timeout,
        }
    }

    /// The target printer: the one given, or the only one on the network.
    pub async fn resolve(&self, target: Option<PrinterDescriptor>) -> Result<PrinterDescriptor> {
        resolve_target(&self.locator, target, self.discovery_timeout).await
    }

    /// Build a view of `target`, or of the only discoverable printer.
    #[instrument(skip_all)]
    pub async fn watch(&self, target: Option<PrinterDescriptor>) -> Result<DashboardView> {
        let descriptor = self.resolve(target).await?;

        let ((status, info), camera) = tokio::join!(
            self.read_status(&descriptor),
            self.camera.probe_default(&descriptor)
        );

        let descriptor = match info {
            Some(info) => descriptor.with_info(&info),
            None => descriptor,
        };
        info!(
            printer = %descriptor,
            status_ready = status.is_ready(),
            camera = camera.available,
            "dashboard view assembled"
        );
        Ok(DashboardView {
            descriptor,
            status,
            camera,
            observed_at: Utc::now(),
        })
    }

    /// Open, poll, best-effort identify, close.
    async fn read_status(
        &self,
        descriptor: &PrinterDescriptor,
    ) -> (FieldOutcome<MachineStatus>, Option<PrinterInfo>) {
        let mut session = match self.opener.open(descriptor).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "could not open control session");
                return (FieldOutcome::from(&e), None);
            }
        };

        let status = session.status().await;
        let info = match &status {
            Ok(_) => session
                .info()
                .await
                .inspect_err(|e| warn!(error = %e, "printer info unavailable"))
                .ok(),
            Err(_) => None,
        };
        session.close().await;
        (status.into(), info)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::io::DuplexStream;

    use forgelink_core::config::CameraConfig;
    use forgelink_core::types::DeviceState;

    use super::*;
    use crate::camera::AttemptOutcome;
    use crate::testkit::{FakePrinter, descriptor, quick_timeouts};

    struct FixedLocator(Vec<PrinterDescriptor>);

    impl PrinterLocator for FixedLocator {
        async fn locate(&self, _timeout: Duration) -> Result<Vec<PrinterDescriptor>> {
            Ok(self.0.clone())
        }
    }

    /// Hands out sessions to scripted fake printers, one per open.
    struct FakeOpener {
        printers: Mutex<Vec<FakePrinter>>,
    }

    impl FakeOpener {
        fn serving(printer: FakePrinter) -> Self {
            Self {
                printers: Mutex::new(vec![printer]),
            }
        }

        fn unreachable() -> Self {
            Self {
                printers: Mutex::new(Vec::new()),
            }
        }
    }

    impl SessionOpener for FakeOpener {
        type Stream = DuplexStream;

        async fn open(&self, descriptor: &PrinterDescriptor) -> Result<ControlSession<DuplexStream>> {
            let printer = self.printers.lock().unwrap().pop();
            match printer {
                Some(printer) => {
                    let (stream, _log) = printer.spawn();
                    ControlSession::attach(descriptor.clone(), stream, quick_timeouts()).await
                }
                None => Err(ForgeError::Connection("connection refused".into())),
            }
        }
    }

    struct FixedCamera(bool);

    impl StreamProbe for FixedCamera {
        async fn first_byte(&self, _url: &str, _timeout: Duration) -> AttemptOutcome {
            if self.0 {
                AttemptOutcome::FirstByte
            } else {
                AttemptOutcome::Refused("connection refused".into())
            }
        }
    }

    fn camera(up: bool) -> CameraChecker<FixedCamera> {
        CameraChecker::new(
            FixedCamera(up),
            CameraConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                ..CameraConfig::default()
            },
        )
    }

    fn other_printer() -> PrinterDescriptor {
        PrinterDescriptor::discovered("SNOTHER", "Bench", "192.168.1.41".parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn no_printers_is_no_device_found() {
        let dashboard = Dashboard::new(
            FixedLocator(vec![]),
            FakeOpener::unreachable(),
            camera(true),
            Duration::from_millis(10),
        );
        let err = dashboard.watch(None).await.unwrap_err();
        assert!(matches!(err, ForgeError::NoDeviceFound));
    }

    #[tokio::test]
    async fn two_printers_is_ambiguous_and_lists_both() {
        let dashboard = Dashboard::new(
            FixedLocator(vec![descriptor(), other_printer()]),
            FakeOpener::unreachable(),
            camera(true),
            Duration::from_millis(10),
        );
        match dashboard.watch(None).await.unwrap_err() {
            ForgeError::AmbiguousDevice { candidates } => {
                assert_eq!(candidates.len(), 2);
                assert!(candidates.iter().any(|c| c.contains("SNOTHER")));
            }
            other => panic!("expected AmbiguousDevice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_printer_is_watched_with_identity() {
        let dashboard = Dashboard::new(
            FixedLocator(vec![descriptor()]),
            FakeOpener::serving(FakePrinter::printing()),
            camera(true),
            Duration::from_millis(10),
        );
        let view = dashboard.watch(None).await.unwrap();

        let status = view.status.value().unwrap();
        assert_eq!(status.state, DeviceState::Printing);
        assert_eq!(status.progress_percent, 52.0);
        assert!(view.camera.available);
        assert_eq!(view.descriptor.model.as_deref(), Some("Flashforge Adventurer 5M"));
        assert_eq!(view.descriptor.name, "Workshop");
    }

    #[tokio::test]
    async fn unreachable_control_port_still_reports_camera() {
        let dashboard = Dashboard::new(
            FixedLocator(vec![]),
            FakeOpener::unreachable(),
            camera(true),
            Duration::from_millis(10),
        );
        let view = dashboard.watch(Some(descriptor())).await.unwrap();

        match &view.status {
            FieldOutcome::Failed { kind, .. } => assert_eq!(kind, "connection"),
            other => panic!("expected a failed status, got {other:?}"),
        }
        assert!(view.camera.available);
        assert_eq!(view.descriptor.serial_number, "SNADVA5M0042");
    }

    #[tokio::test]
    async fn camera_down_does_not_hide_status() {
        let dashboard = Dashboard::new(
            FixedLocator(vec![]),
            FakeOpener::serving(FakePrinter::idle()),
            camera(false),
            Duration::from_millis(10),
        );
        let view = dashboard.watch(Some(descriptor())).await.unwrap();
        assert!(view.status.is_ready());
        assert!(!view.camera.available);
        assert_eq!(view.camera.attempts, 2);
    }

    #[tokio::test]
    async fn discovered_printer_with_dead_camera_still_reports_status() {
        let dashboard = Dashboard::new(
            FixedLocator(vec![descriptor()]),
            FakeOpener::serving(FakePrinter::printing()),
            camera(false),
            Duration::from_millis(10),
        );
        let view = dashboard.watch(None).await.unwrap();

        let status = view.status.value().unwrap();
        assert_eq!(status.state, DeviceState::Printing);
        assert_eq!(status.current_layer, 147);
        assert!(!view.camera.available);
        assert_eq!(view.camera.attempts, 2);
        assert!(view.camera.last_failure.is_some());
        assert_eq!(view.descriptor.serial_number, "SNADVA5M0042");
    }

    #[tokio::test]
    async fn failed_status_serialises_with_kind() {
        let outcome: FieldOutcome<MachineStatus> =
            FieldOutcome::from(&ForgeError::Timeout("no reply to M119".into()));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["kind"], "timeout");
    }
}
