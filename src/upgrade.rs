//! Upgrade session orchestrator.
//!
//! Sequences the three phases of one upgrade attempt (upload, install,
//! reboot) over a shared event stream connection. Phases are strictly
//! sequential; the first failure aborts the rest and becomes the
//! terminal, user-visible status.

use crate::config::ClientConfig;
use crate::events::{EventStream, StreamEvent};
use crate::install::{self, InstallProgress};
use crate::log::{LogBuffer, Severity};
use crate::models::{CancelToken, UpgradeReport, UpgradeSession};
use crate::reboot::{self, RebootContext};
use crate::rpc::UbusClient;
use crate::upload::{self, UploadProgress};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Terminal failure of an upgrade session. Every variant aborts the
/// remaining phases; none is retried automatically.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The session lacks permission; nothing was uploaded.
    #[error("Not enough permissions")]
    Authorization,

    /// The upload transport failed.
    #[error("Uploading failure")]
    Transport(#[source] anyhow::Error),

    /// No heartbeat within the stall window during installation.
    #[error("Installation timed out")]
    StallTimeout,

    /// The device reported an explicit installation failure.
    #[error("Installation failure")]
    DeviceFailure,

    /// The user aborted the session.
    #[error("Upgrade cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Ready,
    Working,
    Success,
    Error,
}

/// User-visible status line of the session.
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub kind: StatusKind,
    pub message: String,
}

impl Default for StatusLine {
    fn default() -> Self {
        Self {
            kind: StatusKind::Ready,
            message: "Ready for upgrade".to_string(),
        }
    }
}

/// Receiving ends of the session's display channels.
pub struct UpgradeMonitor {
    pub status: watch::Receiver<StatusLine>,
    pub upload: mpsc::UnboundedReceiver<UploadProgress>,
    pub install: watch::Receiver<InstallProgress>,
}

pub struct Upgrader {
    http: reqwest::Client,
    config: ClientConfig,
    log: LogBuffer,
    cancel: CancelToken,
    status: watch::Sender<StatusLine>,
    upload_progress: mpsc::UnboundedSender<UploadProgress>,
    install_progress: watch::Sender<InstallProgress>,
}

impl Upgrader {
    pub fn new(config: ClientConfig) -> (Self, UpgradeMonitor) {
        let (status_tx, status_rx) = watch::channel(StatusLine::default());
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();
        let (install_tx, install_rx) = watch::channel(InstallProgress::default());

        let upgrader = Self {
            http: reqwest::Client::new(),
            config,
            log: LogBuffer::new(),
            cancel: CancelToken::new(),
            status: status_tx,
            upload_progress: upload_tx,
            install_progress: install_tx,
        };

        let monitor = UpgradeMonitor {
            status: status_rx,
            upload: upload_rx,
            install: install_rx,
        };

        (upgrader, monitor)
    }

    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run one upgrade session to completion. Takes `&mut self` so no
    /// two sessions of one client can ever be in flight at once.
    pub async fn run(&mut self, session: &UpgradeSession) -> Result<UpgradeReport, UpgradeError> {
        self.log.clear();
        self.set_status(StatusKind::Working, "Upgrade in progress, please wait...");
        info!(
            file = %session.file_name,
            size = session.file_size,
            dry_run = session.dry_run,
            "starting upgrade session"
        );

        let stream_url = format!(
            "{}/ubus/subscribe/swupdate?{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.session_id
        );
        let (stream, events) = EventStream::connect(self.http.clone(), stream_url);
        let router = EventRouter::spawn(events, self.log.clone());
        let rpc = UbusClient::new(
            self.http.clone(),
            &self.config.base_url,
            self.config.session_id.clone(),
        );

        let result = self.run_phases(&stream, &router, &rpc, session).await;

        match &result {
            Ok(report) => {
                self.set_status(StatusKind::Success, "Successfully completed");
                info!(?report, "upgrade session finished");
            }
            Err(e) => {
                self.set_status(StatusKind::Error, e.to_string());
                warn!("upgrade session failed: {e}");
            }
        }

        stream.close();
        result
    }

    async fn run_phases(
        &self,
        stream: &EventStream,
        router: &EventRouter,
        rpc: &UbusClient,
        session: &UpgradeSession,
    ) -> Result<UpgradeReport, UpgradeError> {
        // Authorization gates everything; nothing is uploaded without it.
        self.log.ui(Severity::Info, "Checking permissions...");
        if !rpc.session_access("cgi-swupdate", "update", "write").await {
            self.log.ui(Severity::Error, "Not enough permissions");
            return Err(UpgradeError::Authorization);
        }
        self.check_cancelled()?;

        upload::upload(
            &self.http,
            &self.config.base_url,
            &self.config.session_id,
            session,
            self.cancel.clone(),
            self.upload_progress.clone(),
            &self.log,
        )
        .await?;
        self.check_cancelled()?;

        self.set_status(
            StatusKind::Working,
            "Installation in progress, please wait...",
        );
        let tap = router.register_tap();
        let outcome = install::watch_install(
            tap,
            self.log.clone(),
            self.install_progress.clone(),
            self.cancel.clone(),
        )
        .await;
        router.clear_tap();
        let outcome = outcome?;
        self.check_cancelled()?;

        let rebooted = reboot::run(
            RebootContext {
                http: &self.http,
                base_url: &self.config.base_url,
                rpc,
                stream,
                log: &self.log,
                status: &self.status,
                cancel: &self.cancel,
            },
            session.dry_run,
            outcome.items_to_install,
        )
        .await?;

        Ok(UpgradeReport {
            version: outcome.version,
            items_installed: outcome.items_to_install,
            rebooted,
        })
    }

    fn set_status(&self, kind: StatusKind, message: impl Into<String>) {
        self.status.send_replace(StatusLine {
            kind,
            message: message.into(),
        });
    }

    fn check_cancelled(&self) -> Result<(), UpgradeError> {
        if self.cancel.is_cancelled() {
            Err(UpgradeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

type EventTap = Arc<Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>>;

/// Owns the stream receiver for the whole session. `info` events are
/// logged at all times; while the install phase is active, every event
/// is forwarded to its tap instead.
struct EventRouter {
    tap: EventTap,
    task: tokio::task::JoinHandle<()>,
}

impl EventRouter {
    fn spawn(mut events: mpsc::UnboundedReceiver<StreamEvent>, log: LogBuffer) -> Self {
        let tap: EventTap = Arc::new(Mutex::new(None));

        let task = tokio::spawn({
            let tap = Arc::clone(&tap);
            async move {
                while let Some(event) = events.recv().await {
                    if !route(&tap, event.clone()) {
                        log_unrouted(&log, &event);
                    }
                }
            }
        });

        Self { tap, task }
    }

    /// Start forwarding all events to a new receiver.
    fn register_tap(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tap.lock().unwrap() = Some(tx);
        rx
    }

    fn clear_tap(&self) {
        *self.tap.lock().unwrap() = None;
    }
}

impl Drop for EventRouter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Forward into the tap if one is registered. A dead tap is unregistered
/// on the spot.
fn route(tap: &EventTap, event: StreamEvent) -> bool {
    let mut guard = tap.lock().unwrap();
    match guard.as_ref() {
        Some(tx) => {
            if tx.send(event).is_ok() {
                true
            } else {
                *guard = None;
                false
            }
        }
        None => false,
    }
}

fn log_unrouted(log: &LogBuffer, event: &StreamEvent) {
    if event.event != "info" {
        return;
    }

    match serde_json::from_str(&event.data) {
        Ok(info) => log.device(&info),
        Err(_) => log.ui(
            Severity::Warning,
            "Failed to parse received 'info' event data",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogTag;

    fn info_event(msg: &str) -> StreamEvent {
        StreamEvent {
            event: "info".to_string(),
            data: format!(r#"{{"status":2,"level":3,"msg":"{msg}"}}"#),
            id: None,
        }
    }

    #[tokio::test]
    async fn router_logs_info_events_outside_install() {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = LogBuffer::new();
        let router = EventRouter::spawn(rx, log.clone());

        tx.send(info_event("hello")).unwrap();
        tokio::task::yield_now().await;

        let entries = log.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tag, LogTag::Device);
        assert_eq!(entries[0].message, "hello");
        drop(router);
    }

    #[tokio::test]
    async fn router_forwards_everything_while_tapped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = LogBuffer::new();
        let router = EventRouter::spawn(rx, log.clone());

        let mut tap = router.register_tap();
        tx.send(info_event("forwarded")).unwrap();

        let event = tap.recv().await.unwrap();
        assert_eq!(event.event, "info");
        // Forwarded events are not logged by the router.
        assert!(log.is_empty());

        router.clear_tap();
        tx.send(info_event("logged")).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn router_drops_a_dead_tap() {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = LogBuffer::new();
        let router = EventRouter::spawn(rx, log.clone());

        let tap = router.register_tap();
        drop(tap);

        tx.send(info_event("after drop")).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn error_messages_match_the_ui_strings() {
        assert_eq!(UpgradeError::Authorization.to_string(), "Not enough permissions");
        assert_eq!(UpgradeError::StallTimeout.to_string(), "Installation timed out");
        assert_eq!(UpgradeError::DeviceFailure.to_string(), "Installation failure");
        assert_eq!(
            UpgradeError::Transport(anyhow::anyhow!("boom")).to_string(),
            "Uploading failure"
        );
    }
}
