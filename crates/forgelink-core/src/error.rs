// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Forgelink.

use thiserror::Error;

use crate::types::ErrorClass;

/// Top-level error type for all Forgelink operations.
#[derive(Debug, Error)]
pub enum ForgeError {
    // -- Transport --
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    // -- Control protocol --
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session busy: {0}")]
    SessionBusy(String),

    #[error("printer rejected the request: {0}")]
    RemoteRejected(String),

    #[error("upload failed: {0}")]
    Upload(String),

    // -- Device selection --
    #[error("{} printers found ({}); choose one explicitly", .candidates.len(), .candidates.join(", "))]
    AmbiguousDevice { candidates: Vec<String> },

    #[error("no printer found on the local network")]
    NoDeviceFound,

    // -- Local --
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ForgeError {
    /// Stable short tag for per-field reporting and JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::Protocol(_) => "protocol",
            Self::SessionBusy(_) => "session_busy",
            Self::RemoteRejected(_) => "remote_rejected",
            Self::Upload(_) => "upload",
            Self::AmbiguousDevice { .. } => "ambiguous_device",
            Self::NoDeviceFound => "no_device_found",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Classify the error for the caller's retry decision.
    ///
    /// Nothing in Forgelink retries on its own (apart from the camera
    /// backoff); this only tells the caller whether re-invoking the failed
    /// operation can help.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::Upload(_) => ErrorClass::Transient,

            Self::RemoteRejected(_)
            | Self::AmbiguousDevice { .. }
            | Self::NoDeviceFound
            | Self::Config(_) => ErrorClass::UserAction,

            Self::Protocol(_) | Self::SessionBusy(_) | Self::Serialization(_) => {
                ErrorClass::Permanent
            }

            Self::Io(io_err) => match io_err.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::Interrupted => ErrorClass::Transient,
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    ErrorClass::UserAction
                }
                _ => ErrorClass::Permanent,
            },
        }
    }

    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ForgeError>;
