// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Forgelink Client: UDP discovery, the TCP control session, job upload, and
// camera availability checks for FlashForge printers.  Everything that talks
// to the network lives here; the domain types come from `forgelink-core`.

pub mod camera;
pub mod dashboard;
pub mod discovery;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod upload;

#[cfg(test)]
pub(crate) mod testkit;

pub use camera::{CameraChecker, HttpStreamProbe, StreamProbe};
pub use dashboard::{Dashboard, DashboardView, FieldOutcome, TcpSessionOpener};
pub use discovery::PrinterDiscovery;
pub use session::ControlSession;
pub use upload::{JobUploader, Upload};
