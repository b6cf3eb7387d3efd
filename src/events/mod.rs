//! Long-lived push event stream from the device.
//!
//! One subscription per rendered session. The connection reconnects on
//! its own after transport failures, resending the last seen event id so
//! the server may resume from that cursor; servers that replay from the
//! start are tolerated. Only an explicit [`EventStream::close`] is
//! terminal.

pub mod decoder;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub use decoder::{DEFAULT_RETRY, EventDecoder};

/// Connection lifecycle. `Closed` is terminal and only reached through
/// [`EventStream::close`]; any other disconnect goes back to `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// One decoded event record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Handle to the stream connection. Cheap to clone; all clones observe
/// and control the same connection.
#[derive(Clone)]
pub struct EventStream {
    state: watch::Sender<ConnectionState>,
}

impl EventStream {
    /// Open the subscription and spawn the connection task. Decoded
    /// events arrive on the returned receiver; dropping it shuts the
    /// connection down.
    pub fn connect(
        http: reqwest::Client,
        url: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        tokio::spawn(run_connection(http, url.into(), state_tx.clone(), state_rx, events_tx));

        (Self { state: state_tx }, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Close the connection. Idempotent and irreversible.
    pub fn close(&self) {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });

        if transitioned {
            debug!("event stream closed");
        }
    }
}

/// Transition connection state unless already terminally closed.
fn set_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state.send_if_modified(|current| {
        if *current == ConnectionState::Closed || *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

async fn closed(state_rx: &mut watch::Receiver<ConnectionState>) {
    // An error means every handle is gone; treat that as closed too.
    let _ = state_rx
        .wait_for(|state| *state == ConnectionState::Closed)
        .await;
}

async fn run_connection(
    http: reqwest::Client,
    url: String,
    state: watch::Sender<ConnectionState>,
    mut state_rx: watch::Receiver<ConnectionState>,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    let mut decoder = EventDecoder::new();

    loop {
        if *state_rx.borrow() == ConnectionState::Closed {
            return;
        }

        let mut request = http
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");

        if let Some(id) = decoder.last_event_id() {
            request = request.header("Last-Event-ID", id);
        }

        let response = tokio::select! {
            _ = closed(&mut state_rx) => return,
            response = request.send() => response,
        };

        match response.and_then(|r| r.error_for_status()) {
            Ok(response) => {
                set_state(&state, ConnectionState::Open);
                debug!("event stream connected");

                let mut body = response.bytes_stream();
                loop {
                    let chunk = tokio::select! {
                        _ = closed(&mut state_rx) => return,
                        chunk = body.next() => chunk,
                    };

                    match chunk {
                        Some(Ok(bytes)) => {
                            for event in decoder.feed(&bytes) {
                                if events.send(event).is_err() {
                                    // Receiver gone; nobody is listening.
                                    set_state(&state, ConnectionState::Closed);
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!("event stream read failed: {e}");
                            break;
                        }
                        None => {
                            debug!("event stream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                debug!("event stream connect failed: {e}");
            }
        }

        set_state(&state, ConnectionState::Connecting);
        decoder.reset_stream();

        tokio::select! {
            _ = closed(&mut state_rx) => return,
            _ = tokio::time::sleep(decoder.retry_interval()) => {}
        }
    }
}
