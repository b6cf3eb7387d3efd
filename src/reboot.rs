//! Reboot phase: decide whether the device must restart after a
//! successful installation, and wait out the restart when it does.

use crate::events::EventStream;
use crate::log::{LogBuffer, Severity};
use crate::models::CancelToken;
use crate::rpc::UbusClient;
use crate::upgrade::{StatusKind, StatusLine, UpgradeError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// UI settling delay before an immediate completion is reported.
const COMPLETE_SETTLE_DELAY: Duration = Duration::from_millis(1500);

const RECONNECT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
const RECONNECT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the reboot phase must do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootAction {
    /// Dry run requested; nothing was flashed.
    DryRunComplete,
    /// The device reported zero items to install.
    NothingInstalled,
    /// Installed, but no reboot is needed.
    Complete,
    /// Installed and the device will restart.
    AwaitReconnect,
}

/// The reboot decision table.
pub fn decide(dry_run: bool, items_to_install: Option<u32>, reboot_required: bool) -> RebootAction {
    if dry_run {
        RebootAction::DryRunComplete
    } else if items_to_install == Some(0) {
        RebootAction::NothingInstalled
    } else if !reboot_required {
        RebootAction::Complete
    } else {
        RebootAction::AwaitReconnect
    }
}

pub struct RebootContext<'a> {
    pub http: &'a reqwest::Client,
    pub base_url: &'a str,
    pub rpc: &'a UbusClient,
    pub stream: &'a EventStream,
    pub log: &'a LogBuffer,
    pub status: &'a watch::Sender<StatusLine>,
    pub cancel: &'a CancelToken,
}

/// Run the reboot phase. Returns whether the device rebooted.
pub async fn run(
    ctx: RebootContext<'_>,
    dry_run: bool,
    items_to_install: Option<u32>,
) -> Result<bool, UpgradeError> {
    let reboot_required = ctx.rpc.reboot_state().await;
    let action = decide(dry_run, items_to_install, reboot_required);
    debug!("reboot decision: {action:?}");

    match action {
        RebootAction::DryRunComplete => {
            tokio::time::sleep(COMPLETE_SETTLE_DELAY).await;
            ctx.log
                .ui(Severity::Success, "Dry run successfully completed");
            Ok(false)
        }
        RebootAction::NothingInstalled => {
            tokio::time::sleep(COMPLETE_SETTLE_DELAY).await;
            ctx.log.ui(
                Severity::Success,
                "The device firmware already matches the uploaded firmware. \
                 Firmware upgrade has not been done since it is not required",
            );
            Ok(false)
        }
        RebootAction::Complete => {
            tokio::time::sleep(COMPLETE_SETTLE_DELAY).await;
            ctx.log.ui(Severity::Success, "Successfully completed");
            Ok(false)
        }
        RebootAction::AwaitReconnect => {
            ctx.log.ui(Severity::Info, "Rebooting device...");
            ctx.status.send_replace(StatusLine {
                kind: StatusKind::Working,
                message: "Rebooting, please wait...".to_string(),
            });

            // No events can arrive across the restart; further disconnects
            // must not trigger reconnect attempts of their own.
            ctx.stream.close();

            ctx.log.ui(
                Severity::Notice,
                "Waiting for the new system to be started after firmware upgrade...",
            );
            await_reconnect(ctx.http, ctx.base_url, ctx.cancel).await?;
            Ok(true)
        }
    }
}

/// Poll the device's original address until it answers again.
async fn await_reconnect(
    http: &reqwest::Client,
    base_url: &str,
    cancel: &CancelToken,
) -> Result<(), UpgradeError> {
    loop {
        tokio::time::sleep(RECONNECT_POLL_INTERVAL).await;

        if cancel.is_cancelled() {
            return Err(UpgradeError::Cancelled);
        }

        let probe = http
            .get(base_url)
            .timeout(RECONNECT_PROBE_TIMEOUT)
            .send()
            .await;

        // Any HTTP answer means the device is back, whatever the status.
        if probe.is_ok() {
            debug!("device reachable again");
            return Ok(());
        }
    }
}
