//! Wire-level types shared with the device-side updater.
//!
//! The numeric status and level codes are part of the updater's external
//! protocol and must stay byte-for-byte in sync with its status header.

use serde::Deserialize;
use std::collections::HashMap;

/// Installation status reported by the updater.
///
/// Must be kept in sync with the updater's `swupdate_status.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Idle = 0,
    Start = 1,
    Run = 2,
    Success = 3,
    Failure = 4,
    Download = 5,
    Done = 6,
    Subprocess = 7,
    Progress = 8,
}

impl Status {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Status::Idle),
            1 => Some(Status::Start),
            2 => Some(Status::Run),
            3 => Some(Status::Success),
            4 => Some(Status::Failure),
            5 => Some(Status::Download),
            6 => Some(Status::Done),
            7 => Some(Status::Subprocess),
            8 => Some(Status::Progress),
            _ => None,
        }
    }
}

/// Message level reported by the updater.
///
/// Must be kept in sync with the updater's `util.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Level {
    Error = 1,
    Warning = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Level::Error),
            2 => Some(Level::Warning),
            3 => Some(Level::Info),
            4 => Some(Level::Debug),
            5 => Some(Level::Trace),
            _ => None,
        }
    }
}

/// Payload of an `info` stream event: one log line from the updater.
#[derive(Debug, Clone, Deserialize)]
pub struct InfoEvent {
    #[serde(default)]
    pub status: u32,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub error: bool,
}

/// Payload of a `progress` stream event.
///
/// `RUN` events carry an embedded JSON document in `info`; `PROGRESS`
/// events carry the step fields instead.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressEvent {
    #[serde(default)]
    pub status: u32,
    #[serde(default)]
    pub cur_percent: u32,
    #[serde(default)]
    pub cur_step: u32,
    #[serde(default)]
    pub nsteps: u32,
    #[serde(default)]
    pub info: String,
}

impl ProgressEvent {
    /// Decode the embedded `RUN` payload, if any. Returns `None` for
    /// absent or malformed documents; callers treat both the same way.
    pub fn run_info(&self) -> Option<RunInfo> {
        if self.info.is_empty() {
            return None;
        }
        serde_json::from_str(&self.info).ok()
    }
}

/// Embedded payload of a `RUN` progress event, keyed by source index.
/// Only source "0" (the main installer process) is of interest.
#[derive(Debug, Clone, Deserialize)]
pub struct RunInfo {
    #[serde(flatten)]
    pub sources: HashMap<String, RunSource>,
}

impl RunInfo {
    pub fn main(&self) -> Option<&RunSource> {
        self.sources.get("0")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSource {
    #[serde(rename = "VERSION")]
    pub version: Option<String>,
    #[serde(rename = "ITEMS_TO_INSTALL")]
    pub items_to_install: Option<u32>,
}
