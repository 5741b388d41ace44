//! Frame Decoder
//!
//! Incremental decoder for the generation event stream.
//!
//! # Record Format
//!
//! ```text
//! data: {"type":"message","content":"Hel"}\n
//! \n                                   <- optional blank separator
//! data: {"type":"done"}\n
//! ```
//!
//! The transport may split or coalesce records arbitrarily. Lines are split
//! on `\n` at the byte level, so a multi-byte UTF-8 sequence cut by a chunk
//! boundary is reassembled before it is decoded.
//!
//! A malformed record is dropped with a warning and decoding continues. The
//! one exception is a malformed *terminal* record (its `type` names `done`,
//! `error` or `final_response`): it is surfaced as [`ProtocolEvent::Error`],
//! because the turn cannot finish cleanly without it.

use serde_json::Value;

use super::event::{ProtocolEvent, TERMINAL_TAGS};

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Field prefix marking a record line
const DATA_FIELD: &[u8] = b"data:";

/// Decoder state machine for streaming record parsing
///
/// Buffers incoming bytes and yields complete events in arrival order.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    /// Bytes before this position hold no newline past `read_pos`
    scan_pos: usize,
    /// Records dropped because they failed to parse
    dropped: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            scan_pos: 0,
            dropped: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.scan_pos -= self.read_pos;
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of undecoded bytes in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Number of records dropped as malformed so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Decode the next complete event, if any
    ///
    /// Returns `None` once only an incomplete trailing line remains.
    pub fn next_event(&mut self) -> Option<ProtocolEvent> {
        loop {
            let scan_from = self.scan_pos.max(self.read_pos);
            let Some(offset) = self.buffer[scan_from..].iter().position(|&b| b == b'\n') else {
                self.scan_pos = self.buffer.len();
                return None;
            };
            let line_start = self.read_pos;
            let line_end = scan_from + offset;
            self.read_pos = line_end + 1;
            self.scan_pos = self.read_pos;

            match decode_line(strip_cr(&self.buffer[line_start..line_end])) {
                Line::Event(event) => return Some(event),
                Line::Dropped => self.dropped += 1,
                Line::Skip => {}
            }
        }
    }

    /// Push a chunk and drain every event it completes
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<ProtocolEvent> {
        self.push(chunk);
        let mut events = Vec::new();
        while let Some(event) = self.next_event() {
            events.push(event);
        }
        events
    }

    /// Handle end of input
    ///
    /// A trailing fragment that still looks like a record is parsed as a
    /// final best-effort record; anything else is discarded.
    pub fn finish(&mut self) -> Option<ProtocolEvent> {
        let remaining = self.buffer.split_off(self.read_pos);
        self.clear();

        let line = strip_cr(trim_ascii(&remaining));
        if line.is_empty() {
            return None;
        }
        if !line.starts_with(DATA_FIELD) {
            tracing::debug!(bytes = line.len(), "Discarding trailing non-record fragment");
            return None;
        }
        match decode_line(line) {
            Line::Event(event) => Some(event),
            Line::Dropped => {
                self.dropped += 1;
                None
            }
            Line::Skip => None,
        }
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
        self.scan_pos = 0;
    }
}

/// Outcome of decoding one line
enum Line {
    Event(ProtocolEvent),
    Skip,
    Dropped,
}

fn decode_line(line: &[u8]) -> Line {
    if line.is_empty() || line.starts_with(b":") {
        return Line::Skip;
    }

    let Some(payload) = line.strip_prefix(DATA_FIELD) else {
        // event:, id: and retry: fields carry nothing we need
        tracing::trace!(line = %String::from_utf8_lossy(line), "Skipping non-data line");
        return Line::Skip;
    };
    let payload = payload.strip_prefix(b" ").unwrap_or(payload);

    let text = match std::str::from_utf8(payload) {
        Ok(text) => text.trim(),
        Err(e) => {
            tracing::warn!(error = %e, "Dropping record with invalid UTF-8");
            return Line::Dropped;
        }
    };
    if text.is_empty() {
        return Line::Skip;
    }

    match serde_json::from_str::<ProtocolEvent>(text) {
        Ok(event) => Line::Event(event),
        Err(e) => recover_malformed(text, &e),
    }
}

fn recover_malformed(text: &str, error: &serde_json::Error) -> Line {
    let tag = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_owned));

    if let Some(tag) = tag.filter(|t| TERMINAL_TAGS.contains(&t.as_str())) {
        tracing::warn!(record_type = %tag, error = %error, "Malformed terminal record");
        return Line::Event(ProtocolEvent::Error {
            message: format!("malformed {tag} record: {error}"),
        });
    }

    tracing::warn!(error = %error, data = %text, "Dropping malformed record");
    Line::Dropped
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}
