//! Severity model and the per-session upgrade log.
//!
//! The mapping functions are pure: they translate the updater's
//! status/level codes into one display severity per line. Status-derived
//! severity wins over level-derived severity unless the status maps to
//! plain `Info`, so structural markers (start/success/done) stay visible
//! through a noisy default info level.

use crate::protocol::{InfoEvent, Level, Status};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::{Arc, Mutex};

/// Prefix the updater puts on captured subprocess output lines.
const CMD_OUTPUT_MARKER: &str = "[run_system_cmd] : ";

static SOURCE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[[^\]]*\] : ").unwrap());

/// Display severity of one log line, ordered as the original log classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Success,
    Notice,
    CmdOutput,
    Info,
    Debug,
}

/// Severity derived from an installation status code.
pub fn status_severity(msg: &str, status: u32) -> Severity {
    match Status::from_code(status) {
        Some(Status::Run) => {
            if msg.starts_with(CMD_OUTPUT_MARKER) {
                Severity::CmdOutput
            } else {
                Severity::Info
            }
        }
        Some(Status::Start) | Some(Status::Success) | Some(Status::Done) => Severity::Success,
        _ => Severity::Info,
    }
}

/// Severity derived from a device-reported message level.
pub fn level_severity(level: u32) -> Severity {
    match Level::from_code(level) {
        Some(Level::Error) => Severity::Error,
        Some(Level::Warning) => Severity::Warning,
        Some(Level::Info) => Severity::Info,
        _ => Severity::Debug,
    }
}

/// Combined severity of an `info` event.
///
/// An explicit error flag always wins. Otherwise the status-derived
/// severity applies, falling back to the level-derived one only when the
/// status maps to plain `Info`.
pub fn event_severity(event: &InfoEvent) -> Severity {
    if event.error {
        return Severity::Error;
    }

    let from_status = status_severity(&event.msg, event.status);
    if from_status == Severity::Info {
        level_severity(event.level)
    } else {
        from_status
    }
}

/// Strip one leading bracketed source tag (e.g. `[parser] : `).
pub fn format_message(msg: &str) -> String {
    SOURCE_TAG.replace(msg, "").into_owned()
}

/// Origin of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    /// Generated by this client.
    Ui,
    /// Reported by the device.
    Device,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub tag: LogTag,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only log of one upgrade attempt, cleared in bulk when a new
/// attempt starts. Clones share the same underlying buffer.
#[derive(Clone, Default)]
pub struct LogBuffer {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a client-generated line.
    pub fn ui(&self, severity: Severity, message: impl Into<String>) {
        self.push(LogTag::Ui, severity, message.into());
    }

    /// Append a device-reported line, mapped through the severity model.
    pub fn device(&self, event: &InfoEvent) {
        let severity = event_severity(event);
        self.push(LogTag::Device, severity, format_message(&event.msg));
    }

    fn push(&self, tag: LogTag, severity: Severity, message: String) {
        match severity {
            Severity::Error => tracing::error!(?tag, "{}", message),
            Severity::Warning => tracing::warn!(?tag, "{}", message),
            Severity::Debug => tracing::debug!(?tag, "{}", message),
            _ => tracing::info!(?tag, "{}", message),
        }

        self.entries.lock().unwrap().push(LogEntry {
            tag,
            severity,
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
