//! Install phase watchdog.
//!
//! Consumes `info`/`progress` events from the device while the updater
//! flashes the image, keeps the heartbeat/step state, and resolves the
//! phase on success, device-reported failure, or stall timeout. The state
//! is owned by a single task; the two phase timers and the event tap live
//! in one `select!` loop, so reaching any terminal condition cancels both
//! timers at once and the phase can never settle twice.

use crate::events::StreamEvent;
use crate::log::{LogBuffer, Severity};
use crate::models::CancelToken;
use crate::protocol::{ProgressEvent, Status};
use crate::upgrade::UpgradeError;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, interval_at};
use tracing::debug;

/// The phase fails if the heartbeat has not advanced within this window.
pub const INSTALL_STALL_TIMEOUT: Duration = Duration::from_millis(15000);

/// Poll interval for the terminal-condition check.
pub const INSTALL_CHECK_INTERVAL: Duration = Duration::from_millis(1000);

/// Mutable state of one install phase, reset when the phase starts.
#[derive(Debug, Default)]
pub struct InstallState {
    /// Incremented once per received `progress` event, whatever it says.
    pub heartbeat: u64,
    pub success: bool,
    pub failure: bool,
    /// Monotonic within a phase; regressed step reports are ignored for
    /// display but still advance the heartbeat.
    pub step: u32,
    pub nsteps: u32,
    /// None until the device first reports `ITEMS_TO_INSTALL`.
    pub items_to_install: Option<u32>,
    pub version: Option<String>,
    pub percent: f64,
}

impl InstallState {
    pub fn items_received(&self) -> bool {
        self.items_to_install.is_some()
    }

    fn snapshot(&self) -> InstallProgress {
        InstallProgress {
            percent: self.percent,
            step: self.step,
            nsteps: self.nsteps,
            version: self.version.clone(),
        }
    }

    fn apply_event(&mut self, event: &StreamEvent, log: &LogBuffer) -> bool {
        match event.event.as_str() {
            "info" => {
                match serde_json::from_str(&event.data) {
                    Ok(info) => log.device(&info),
                    Err(_) => {
                        log.ui(Severity::Warning, "Failed to parse received 'info' event data")
                    }
                }
                false
            }
            "progress" => match serde_json::from_str::<ProgressEvent>(&event.data) {
                Ok(progress) => {
                    self.apply_progress(&progress, log);
                    true
                }
                Err(_) => {
                    log.ui(
                        Severity::Warning,
                        "Failed to parse received 'progress' event data",
                    );
                    false
                }
            },
            _ => false,
        }
    }

    fn apply_progress(&mut self, event: &ProgressEvent, log: &LogBuffer) {
        self.heartbeat += 1;

        match Status::from_code(event.status) {
            Some(Status::Failure) => self.failure = true,
            Some(Status::Success) => {
                self.success = true;
                self.percent = 100.0;
            }
            Some(Status::Run) => self.apply_run_info(event, log),
            Some(Status::Progress) => self.apply_step(event),
            _ => {}
        }
    }

    fn apply_run_info(&mut self, event: &ProgressEvent, log: &LogBuffer) {
        // Absent or malformed payloads are swallowed silently.
        let Some(info) = event.run_info() else { return };
        let Some(main) = info.main() else { return };

        if let Some(version) = &main.version {
            self.version = Some(version.clone());
        }

        if let Some(items) = main.items_to_install {
            self.items_to_install = Some(items);

            if items > 0 {
                log.ui(Severity::Notice, format!("Installing {items} item(s)..."));
            } else {
                log.ui(Severity::Notice, "No items to install");
            }
        }
    }

    fn apply_step(&mut self, event: &ProgressEvent) {
        if event.nsteps > self.nsteps {
            self.nsteps = event.nsteps;
        }
        if event.cur_step > self.step {
            self.step = event.cur_step;
        }

        // Out-of-order step reports keep the heartbeat but not the display.
        if event.cur_step > 0 && event.cur_step >= self.step && event.nsteps > 0 {
            self.percent = ((event.cur_step - 1) as f64 * 100.0 + event.cur_percent as f64)
                / event.nsteps as f64;
        }
    }
}

/// Display snapshot of the install phase.
#[derive(Debug, Clone, Default)]
pub struct InstallProgress {
    pub percent: f64,
    pub step: u32,
    pub nsteps: u32,
    pub version: Option<String>,
}

/// What the install phase learned, for the reboot decision.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub items_to_install: Option<u32>,
    pub version: Option<String>,
}

/// Await installation completion, watching for stalls.
pub async fn watch_install(
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    log: LogBuffer,
    progress: watch::Sender<InstallProgress>,
    cancel: CancelToken,
) -> Result<InstallOutcome, UpgradeError> {
    let mut state = InstallState::default();
    progress.send_replace(state.snapshot());

    let start = Instant::now();
    let mut stall = interval_at(start + INSTALL_STALL_TIMEOUT, INSTALL_STALL_TIMEOUT);
    let mut check = interval_at(start + INSTALL_CHECK_INTERVAL, INSTALL_CHECK_INTERVAL);
    let mut seen_heartbeat = state.heartbeat;
    let mut events_open = true;

    loop {
        if cancel.is_cancelled() {
            return Err(UpgradeError::Cancelled);
        }

        tokio::select! {
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    if state.apply_event(&event, &log) {
                        progress.send_replace(state.snapshot());
                    }
                }
                // Stream gone; the stall timer will decide the outcome.
                None => events_open = false,
            },

            _ = stall.tick() => {
                if seen_heartbeat == state.heartbeat {
                    log.ui(Severity::Error, "Installation timed out");
                    return Err(UpgradeError::StallTimeout);
                }
                seen_heartbeat = state.heartbeat;
            }

            _ = check.tick() => {
                if !state.items_received() {
                    continue;
                }

                if state.items_to_install == Some(0) {
                    debug!("nothing to install, resolving install phase");
                    return Ok(outcome(state));
                }
                if state.failure {
                    log.ui(Severity::Error, "Installation failure");
                    return Err(UpgradeError::DeviceFailure);
                }
                if state.success {
                    return Ok(outcome(state));
                }
            }
        }
    }
}

fn outcome(state: InstallState) -> InstallOutcome {
    InstallOutcome {
        items_to_install: state.items_to_install,
        version: state.version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogTag;

    fn progress_event(json: &str) -> StreamEvent {
        StreamEvent {
            event: "progress".to_string(),
            data: json.to_string(),
            id: None,
        }
    }

    fn info_event(json: &str) -> StreamEvent {
        StreamEvent {
            event: "info".to_string(),
            data: json.to_string(),
            id: None,
        }
    }

    fn run_items(items: u32) -> StreamEvent {
        progress_event(&format!(
            r#"{{"status":2,"info":"{{\"0\":{{\"ITEMS_TO_INSTALL\":{items}}}}}"}}"#
        ))
    }

    fn step(step: u32, nsteps: u32, percent: u32) -> StreamEvent {
        progress_event(&format!(
            r#"{{"status":8,"cur_percent":{percent},"cur_step":{step},"nsteps":{nsteps}}}"#
        ))
    }

    fn spawn_watch(
        events: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> (
        tokio::task::JoinHandle<Result<InstallOutcome, UpgradeError>>,
        watch::Receiver<InstallProgress>,
    ) {
        let (tx, rx) = watch::channel(InstallProgress::default());
        let handle = tokio::spawn(watch_install(
            events,
            LogBuffer::new(),
            tx,
            CancelToken::new(),
        ));
        (handle, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn stalls_without_any_events() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let (handle, _) = spawn_watch(rx);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(UpgradeError::StallTimeout)));
        let elapsed = started.elapsed();
        assert!(elapsed >= INSTALL_STALL_TIMEOUT);
        assert!(elapsed < INSTALL_STALL_TIMEOUT + INSTALL_CHECK_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_defers_the_stall() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, _) = spawn_watch(rx);

        // Plain RUN ticks with no payload keep the device "alive" far past
        // one stall window, then the zero-items report resolves the phase.
        tokio::spawn(async move {
            for _ in 0..4 {
                tokio::time::sleep(Duration::from_secs(10)).await;
                tx.send(progress_event(r#"{"status":2}"#)).unwrap();
            }
            tx.send(run_items(0)).unwrap();
        });

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.items_to_install, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_items_resolves_without_success_status() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, _) = spawn_watch(rx);

        tx.send(run_items(0)).unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.items_to_install, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn device_failure_rejects() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, _) = spawn_watch(rx);

        tx.send(run_items(2)).unwrap();
        tx.send(progress_event(r#"{"status":4}"#)).unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(UpgradeError::DeviceFailure)));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resolves_with_version() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, progress) = spawn_watch(rx);

        tx.send(progress_event(
            r#"{"status":2,"info":"{\"0\":{\"VERSION\":\"2.4.0\",\"ITEMS_TO_INSTALL\":3}}"}"#,
        ))
        .unwrap();
        tx.send(progress_event(r#"{"status":3}"#)).unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.version.as_deref(), Some("2.4.0"));
        assert_eq!(outcome.items_to_install, Some(3));

        // SUCCESS forces the displayed percentage to 100.
        assert_eq!(progress.borrow().percent, 100.0);
    }

    #[test]
    fn aggregate_percent_is_monotonic_over_steps() {
        let mut state = InstallState::default();
        let log = LogBuffer::new();

        state.apply_event(&step(1, 2, 50), &log);
        assert_eq!(state.percent, 25.0);

        state.apply_event(&step(2, 2, 50), &log);
        assert_eq!(state.percent, 75.0);

        // A regressed step keeps the heartbeat but not the display.
        state.apply_event(&step(1, 2, 90), &log);
        assert_eq!(state.percent, 75.0);
        assert_eq!(state.heartbeat, 3);
        assert_eq!(state.step, 2);
    }

    #[test]
    fn malformed_event_data_logs_a_warning() {
        let mut state = InstallState::default();
        let log = LogBuffer::new();

        state.apply_event(&progress_event("{not json"), &log);
        assert_eq!(state.heartbeat, 0);

        state.apply_event(&info_event("also not json"), &log);

        let warnings: Vec<_> = log
            .snapshot()
            .into_iter()
            .filter(|e| e.severity == Severity::Warning && e.tag == LogTag::Ui)
            .collect();
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn malformed_run_payload_is_silent() {
        let mut state = InstallState::default();
        let log = LogBuffer::new();

        state.apply_event(&progress_event(r#"{"status":2,"info":"{broken"}"#), &log);

        // Heartbeat advanced, nothing else changed, nothing logged.
        assert_eq!(state.heartbeat, 1);
        assert!(!state.items_received());
        assert!(log.is_empty());
    }

    #[test]
    fn info_events_do_not_touch_the_state_machine() {
        let mut state = InstallState::default();
        let log = LogBuffer::new();

        state.apply_event(&info_event(r#"{"status":2,"level":3,"msg":"copying"}"#), &log);

        assert_eq!(state.heartbeat, 0);
        assert_eq!(log.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_the_phase() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (progress_tx, _progress_rx) = watch::channel(InstallProgress::default());
        let cancel = CancelToken::new();
        let handle = tokio::spawn(watch_install(
            rx,
            LogBuffer::new(),
            progress_tx,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
        // Any wakeup notices the cancellation.
        tx.send(progress_event(r#"{"status":2}"#)).unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(UpgradeError::Cancelled)));
    }
}
