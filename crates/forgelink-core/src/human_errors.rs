// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Operator-facing error messages.
//
// Every technical error is mapped to a plain sentence plus what to try next.
// The severity drives how the CLI presents it.

use crate::error::ForgeError;

/// Severity of an error from the operator's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Network blip or timeout; trying again may work.
    Transient,
    /// The operator must do something (pick a printer, free storage).
    ActionRequired,
    /// Retrying will not help: firmware mismatch or a bad file.
    Permanent,
}

/// A human-readable error with an actionable suggestion.
#[derive(Debug, Clone)]
pub struct HumanError {
    /// One-line summary.
    pub message: String,
    /// What the operator should try.
    pub suggestion: String,
    /// Whether re-running the command may succeed.
    pub retriable: bool,
    pub severity: Severity,
}

/// Convert a `ForgeError` into a `HumanError`.
pub fn humanize_error(err: &ForgeError) -> HumanError {
    match err {
        ForgeError::Connection(detail) => {
            if detail.to_ascii_lowercase().contains("refused") {
                HumanError {
                    message: "The printer refused the connection.".into(),
                    suggestion: "Check the printer is on and that LAN mode is enabled in its network settings.".into(),
                    retriable: true,
                    severity: Severity::Transient,
                }
            } else {
                HumanError {
                    message: "Lost contact with the printer.".into(),
                    suggestion: format!("Check the printer is on the same network, then reconnect. ({detail})"),
                    retriable: true,
                    severity: Severity::Transient,
                }
            }
        }

        ForgeError::Timeout(_) => HumanError {
            message: "The printer didn't respond in time.".into(),
            suggestion: "It may be busy or asleep. Wait a moment and try again, or raise FORGELINK_READ_TIMEOUT_MS.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        ForgeError::Protocol(detail) => HumanError {
            message: "The printer sent a reply we couldn't understand.".into(),
            suggestion: format!("The firmware may use a newer reply format. Nothing was assumed about the printer's state. ({detail})"),
            retriable: false,
            severity: Severity::Permanent,
        },

        ForgeError::SessionBusy(detail) => HumanError {
            message: "A command was issued while the printer was still answering another.".into(),
            suggestion: format!("Reconnect before sending further commands. ({detail})"),
            retriable: false,
            severity: Severity::Permanent,
        },

        ForgeError::RemoteRejected(detail) => humanize_rejection(detail),

        ForgeError::Upload(detail) => HumanError {
            message: "The file transfer was interrupted.".into(),
            suggestion: format!("The printer did not confirm the file, so nothing will print. Send it again. ({detail})"),
            retriable: true,
            severity: Severity::Transient,
        },

        ForgeError::AmbiguousDevice { candidates } => HumanError {
            message: format!("Found {} printers on the network.", candidates.len()),
            suggestion: format!("Choose one with --ip. Candidates: {}", candidates.join(", ")),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        ForgeError::NoDeviceFound => HumanError {
            message: "No printers found.".into(),
            suggestion: "Make sure the printer is on, connected to the same network, and LAN mode is enabled. Use --ip if discovery is blocked on this network.".into(),
            retriable: true,
            severity: Severity::ActionRequired,
        },

        ForgeError::Config(detail) => HumanError {
            message: "A setting is invalid.".into(),
            suggestion: format!("Fix the value and run the command again. ({detail})"),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        ForgeError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::NotFound => HumanError {
                message: "The file couldn't be found.".into(),
                suggestion: "Check the path to the sliced file and try again.".into(),
                retriable: false,
                severity: Severity::ActionRequired,
            },
            std::io::ErrorKind::PermissionDenied => HumanError {
                message: "Permission denied reading the file.".into(),
                suggestion: "Check the file permissions, or copy it somewhere readable first.".into(),
                retriable: false,
                severity: Severity::ActionRequired,
            },
            _ => HumanError {
                message: "There was a problem reading or writing a file.".into(),
                suggestion: format!("Try again. ({io_err})"),
                retriable: true,
                severity: Severity::Transient,
            },
        },

        ForgeError::Serialization(_) => HumanError {
            message: "Couldn't format the output.".into(),
            suggestion: "Try again without --json. If this keeps happening, please report it.".into(),
            retriable: false,
            severity: Severity::Permanent,
        },
    }
}

/// Interpret the device's own rejection text.
fn humanize_rejection(detail: &str) -> HumanError {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("space") || lower.contains("storage") || lower.contains("full") {
        HumanError {
            message: "The printer's storage is full.".into(),
            suggestion: format!("Delete old files from the printer, then send the job again. (Printer said: {detail})"),
            retriable: false,
            severity: Severity::ActionRequired,
        }
    } else if lower.contains("busy") || lower.contains("printing") {
        HumanError {
            message: "The printer is busy.".into(),
            suggestion: format!("Wait for the current job to finish or cancel it on the printer. (Printer said: {detail})"),
            retriable: true,
            severity: Severity::ActionRequired,
        }
    } else if lower.contains("control") {
        HumanError {
            message: "Another program is controlling the printer.".into(),
            suggestion: format!("Close the slicer or other app connected to the printer, then try again. (Printer said: {detail})"),
            retriable: true,
            severity: Severity::ActionRequired,
        }
    } else {
        HumanError {
            message: "The printer refused the request.".into(),
            suggestion: format!("Printer said: {detail}"),
            retriable: false,
            severity: Severity::Permanent,
        }
    }
}
