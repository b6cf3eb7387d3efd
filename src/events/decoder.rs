//! Decoder for the line-oriented push event protocol.
//!
//! Records are blank-line delimited and carry `event:`, `data:`, `id:`
//! and `retry:` fields. Multiple `data:` lines concatenate with a newline
//! separator; a record without data dispatches nothing. Malformed lines
//! are dropped without terminating the stream.

use std::time::Duration;
use tracing::trace;

use super::StreamEvent;

/// Reconnect interval used until the server sends a `retry:` field.
pub const DEFAULT_RETRY: Duration = Duration::from_millis(500);

/// Incremental decoder. Survives reconnects: the resume cursor and retry
/// interval persist, while per-connection buffers reset via
/// [`EventDecoder::reset_stream`].
pub struct EventDecoder {
    buf: Vec<u8>,
    event_type: Option<String>,
    data: Vec<String>,
    last_event_id: Option<String>,
    retry: Duration,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            event_type: None,
            data: Vec::new(),
            last_event_id: None,
            retry: DEFAULT_RETRY,
        }
    }

    /// Resume cursor to resend as `Last-Event-ID` on reconnect.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Current reconnect interval, honoring the most recent `retry:`.
    pub fn retry_interval(&self) -> Duration {
        self.retry
    }

    /// Drop per-connection parse state. Called before a reconnect so a
    /// truncated record from the dead connection cannot leak into the
    /// next one.
    pub fn reset_stream(&mut self) {
        self.buf.clear();
        self.event_type = None;
        self.data.clear();
    }

    /// Feed raw bytes, returning every event completed by this chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            if let Some(event) = self.process_line(line.as_ref()) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<StreamEvent> {
        let line = trim_record_line(line);

        if line.is_empty() {
            return self.dispatch();
        }

        if let Some(value) = field_value(line, "event") {
            self.event_type = Some(value.to_string());
        } else if let Some(value) = field_value(line, "retry") {
            if let Ok(ms) = value.parse::<u64>() {
                self.retry = Duration::from_millis(ms);
            }
        } else if let Some(value) = field_value(line, "data") {
            self.data.push(value.to_string());
        } else if line.starts_with("id:") {
            self.last_event_id = field_value(line, "id").map(str::to_string);
        } else if line.starts_with("id") {
            // A bare `id` line resets the cursor.
            self.last_event_id = None;
        } else {
            trace!("dropping malformed record line: {line:?}");
        }

        None
    }

    fn dispatch(&mut self) -> Option<StreamEvent> {
        if self.data.is_empty() {
            self.event_type = None;
            return None;
        }

        let event = StreamEvent {
            event: self.event_type.take().unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.last_event_id.clone(),
        };
        Some(event)
    }
}

/// Strip leading/trailing whitespace, including non-breaking spaces.
fn trim_record_line(line: &str) -> &str {
    line.trim_matches(|c: char| c.is_whitespace() || c == '\u{00a0}')
}

/// If `line` starts with the field name, return its value: the remainder
/// with one optional `:` and any following spaces removed.
fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    let rest = rest.strip_prefix(':').unwrap_or(rest);
    Some(rest.trim_start_matches(' '))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_str(decoder: &mut EventDecoder, s: &str) -> Vec<StreamEvent> {
        decoder.feed(s.as_bytes())
    }

    #[test]
    fn decodes_a_basic_record() {
        let mut d = EventDecoder::new();
        let events = feed_str(&mut d, "event: progress\ndata: {\"status\":8}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "progress");
        assert_eq!(events[0].data, "{\"status\":8}");
        assert_eq!(events[0].id, None);
    }

    #[test]
    fn event_type_defaults_to_message() {
        let mut d = EventDecoder::new();
        let events = feed_str(&mut d, "data: hello\n\n");
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn multiple_data_lines_join_with_newline() {
        let mut d = EventDecoder::new();
        let events = feed_str(&mut d, "data: a\ndata: b\ndata: c\n\n");
        assert_eq!(events[0].data, "a\nb\nc");
    }

    #[test]
    fn record_without_data_dispatches_nothing() {
        let mut d = EventDecoder::new();
        let events = feed_str(&mut d, "event: info\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn chunks_reassemble_across_feeds() {
        let mut d = EventDecoder::new();
        assert!(feed_str(&mut d, "event: inf").is_empty());
        assert!(feed_str(&mut d, "o\ndata: par").is_empty());
        let events = feed_str(&mut d, "tial\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "info");
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn id_field_sets_cursor_and_rides_on_events() {
        let mut d = EventDecoder::new();
        let events = feed_str(&mut d, "id: 42\ndata: x\n\n");
        assert_eq!(events[0].id.as_deref(), Some("42"));
        assert_eq!(d.last_event_id(), Some("42"));
    }

    #[test]
    fn bare_id_line_resets_cursor() {
        let mut d = EventDecoder::new();
        feed_str(&mut d, "id: 42\ndata: x\n\n");
        feed_str(&mut d, "id\ndata: y\n\n");
        assert_eq!(d.last_event_id(), None);
    }

    #[test]
    fn retry_updates_reconnect_interval() {
        let mut d = EventDecoder::new();
        assert_eq!(d.retry_interval(), DEFAULT_RETRY);
        feed_str(&mut d, "retry: 2500\n\n");
        assert_eq!(d.retry_interval(), Duration::from_millis(2500));
    }

    #[test]
    fn malformed_retry_is_ignored() {
        let mut d = EventDecoder::new();
        feed_str(&mut d, "retry: soon\n\n");
        assert_eq!(d.retry_interval(), DEFAULT_RETRY);
    }

    #[test]
    fn unknown_lines_are_dropped() {
        let mut d = EventDecoder::new();
        let events = feed_str(&mut d, ": comment\nbogus line\ndata: ok\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "ok");
    }

    #[test]
    fn crlf_lines_are_trimmed() {
        let mut d = EventDecoder::new();
        let events = feed_str(&mut d, "event: info\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "info");
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn cursor_survives_stream_reset() {
        let mut d = EventDecoder::new();
        feed_str(&mut d, "id: 7\ndata: x\n\nevent: info\ndata: trunc");
        d.reset_stream();
        assert_eq!(d.last_event_id(), Some("7"));
        // The truncated record is gone.
        let events = feed_str(&mut d, "ated\n\n");
        assert!(events.is_empty());
    }
}
