//! Upload phase: streams the firmware image to the device and tracks
//! transfer speed from progress callbacks.

use crate::log::{LogBuffer, Severity};
use crate::models::{CancelToken, UpgradeSession};
use crate::upgrade::UpgradeError;
use anyhow::anyhow;
use serde_json::Value;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Quiet period after which the current-speed display decays to unknown.
pub const CURRENT_SPEED_CLEAR_TIMEOUT: Duration = Duration::from_millis(2000);

/// Settling delay before a transport failure is reported, so a transient
/// network state cannot flash a premature error.
const FAILURE_SETTLE_DELAY: Duration = Duration::from_millis(2500);

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Transfer statistics for one upload. Speeds are undefined until at
/// least two progress samples have been observed.
#[derive(Debug, Default)]
pub struct UploadStats {
    bytes_uploaded: u64,
    total_bytes: u64,
    samples: u32,
    started_at: Option<Instant>,
    last_at: Option<Instant>,
    current_speed: Option<f64>,
    average_speed: Option<f64>,
}

impl UploadStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one progress callback. The first sample only sets the
    /// epoch; later samples compute speeds. A zero time delta skips the
    /// speed update entirely.
    pub fn record(&mut self, uploaded: u64, total: u64, now: Instant) {
        if self.samples == 0 {
            self.started_at = Some(now);
            self.last_at = Some(now);
        } else {
            let previous = self.last_at.unwrap_or(now);
            let delta = now.saturating_duration_since(previous).as_secs_f64();
            if delta > 0.0 {
                let delta_bytes = uploaded.saturating_sub(self.bytes_uploaded);
                self.current_speed = Some(delta_bytes as f64 / delta);

                let elapsed = now
                    .saturating_duration_since(self.started_at.unwrap_or(now))
                    .as_secs_f64();
                if elapsed > 0.0 {
                    self.average_speed = Some(uploaded as f64 / elapsed);
                }
                self.last_at = Some(now);
            }
        }

        self.bytes_uploaded = uploaded;
        self.total_bytes = total;
        self.samples += 1;
    }

    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.bytes_uploaded as f64 * 100.0 / self.total_bytes as f64
        }
    }

    /// Instantaneous speed in bytes/sec, decayed to unknown when no
    /// sample arrived within the quiet period.
    pub fn current_speed(&self, now: Instant) -> Option<f64> {
        let last = self.last_at?;
        if now.saturating_duration_since(last) > CURRENT_SPEED_CLEAR_TIMEOUT {
            None
        } else {
            self.current_speed
        }
    }

    pub fn average_speed(&self) -> Option<f64> {
        self.average_speed
    }

    /// Deadline at which the current-speed display must decay, if a
    /// decay is still pending.
    fn decay_deadline(&self) -> Option<Instant> {
        match (self.current_speed, self.last_at) {
            (Some(_), Some(last)) => Some(last + CURRENT_SPEED_CLEAR_TIMEOUT),
            _ => None,
        }
    }

    pub fn snapshot(&self, now: Instant) -> UploadProgress {
        UploadProgress {
            bytes_uploaded: self.bytes_uploaded,
            total_bytes: self.total_bytes,
            percent: self.percent(),
            current_speed: self.current_speed(now),
            average_speed: self.average_speed,
            samples: self.samples,
        }
    }
}

/// One progress snapshot for display.
#[derive(Debug, Clone)]
pub struct UploadProgress {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub current_speed: Option<f64>,
    pub average_speed: Option<f64>,
    pub samples: u32,
}

/// Drive the firmware upload. Resolves once the device acknowledges the
/// transfer; any transport failure reports after the settling delay and
/// is terminal for the session.
pub async fn upload(
    http: &reqwest::Client,
    base_url: &str,
    session_id: &str,
    session: &UpgradeSession,
    cancel: CancelToken,
    progress: mpsc::UnboundedSender<UploadProgress>,
    log: &LogBuffer,
) -> Result<(), UpgradeError> {
    log.ui(Severity::Info, "Uploading firmware file into device...");

    let file = tokio::fs::File::open(&session.file_path)
        .await
        .map_err(|e| UpgradeError::Transport(anyhow!("cannot open firmware file: {e}")))?;

    // The tracker exits on its own once the request (which owns the
    // sample sender) is finished.
    let (samples_tx, samples_rx) = mpsc::unbounded_channel();
    tokio::spawn(track_progress(samples_rx, progress));

    let body = upload_body(file, session.file_size, cancel.clone(), samples_tx);
    let part = reqwest::multipart::Part::stream_with_length(body, session.file_size)
        .file_name(session.file_name.clone())
        .mime_str("application/octet-stream")
        .map_err(|e| UpgradeError::Transport(e.into()))?;

    let form = reqwest::multipart::Form::new()
        .text("sessionid", session_id.to_string())
        .text("filename", session.file_name.clone())
        .text("postupdate", "1")
        .text("cleardata", flag(session.clear_data))
        .text("dryrun", flag(session.dry_run))
        .text("swu_software_set", session.software_set.clone())
        .text("swu_running_mode", session.running_mode.clone())
        .part("swupdatedata", part);

    let url = format!("{}/cgi-bin/cgi-swupdate", base_url.trim_end_matches('/'));
    let result = async {
        let response = http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| anyhow!(e))?
            .error_for_status()
            .map_err(|e| anyhow!(e))?;

        let body = response.text().await.unwrap_or_default();
        acknowledge(&body)
    }
    .await;

    match result {
        Ok(()) => {
            debug!("upload acknowledged");
            Ok(())
        }
        Err(_) if cancel.is_cancelled() => Err(UpgradeError::Cancelled),
        Err(e) => {
            // Hold the error back until the network state has settled.
            tokio::time::sleep(FAILURE_SETTLE_DELAY).await;
            log.ui(Severity::Error, "Could not upload firmware file");
            Err(UpgradeError::Transport(e))
        }
    }
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

/// Chunked body over the firmware file, reporting cumulative sent bytes
/// per chunk.
fn upload_body(
    file: tokio::fs::File,
    total: u64,
    cancel: CancelToken,
    samples: mpsc::UnboundedSender<(u64, u64)>,
) -> reqwest::Body {
    let stream = futures_util::stream::try_unfold((file, 0u64), move |(mut file, sent)| {
        let cancel = cancel.clone();
        let samples = samples.clone();
        async move {
            if cancel.is_cancelled() {
                return Err(std::io::Error::other("upload cancelled"));
            }

            let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);

            let sent = sent + n as u64;
            samples.send((sent, total)).ok();
            Ok(Some((buf, (file, sent))))
        }
    });

    reqwest::Body::wrap_stream(stream)
}

/// Fold raw byte samples into stats and publish display snapshots,
/// including the delayed snapshot that clears a stale current speed.
async fn track_progress(
    mut samples: mpsc::UnboundedReceiver<(u64, u64)>,
    progress: mpsc::UnboundedSender<UploadProgress>,
) {
    let mut stats = UploadStats::new();

    loop {
        let deadline = stats.decay_deadline();
        let decay = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            sample = samples.recv() => match sample {
                Some((sent, total)) => {
                    stats.record(sent, total, Instant::now());
                    if progress.send(stats.snapshot(Instant::now())).is_err() {
                        return;
                    }
                }
                None => return,
            },
            _ = decay => {
                stats.current_speed = None;
                if progress.send(stats.snapshot(Instant::now())).is_err() {
                    return;
                }
            }
        }
    }
}

/// Interpret the device's upload response body. The CGI helper answers
/// HTTP 200 even for some failures, flagging them with a `failure` key.
fn acknowledge(body: &str) -> Result<(), anyhow::Error> {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        // Not JSON at all; the HTTP status already said OK.
        return Ok(());
    };

    if value.get("failure").is_some() {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upload rejected by device");
        return Err(anyhow!("{message}"));
    }

    Ok(())
}
