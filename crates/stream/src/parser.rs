//! Incremental decoder for the `text/event-stream` body of the chat endpoints.
//!
//! Records are separated by a blank line. Inside a record only `event:` and
//! `data:` fields carry meaning; comments (`:`) and other fields are skipped,
//! as in WHATWG `EventSource`. The parser keeps no I/O state, so one instance
//! is created per stream and fed whatever chunk boundaries the transport
//! produces.

use snafu::{ResultExt, ensure};

use crate::error::{
    FrameError, FrameResult, InvalidUtf8Snafu, MalformedRecordSnafu, RecordTooLargeSnafu,
    TruncatedUtf8Snafu,
};
use crate::event::{ChatEvent, HandoffStatus};

pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

const RECORD_SEPARATOR: &str = "\n\n";
const DATA_FIELD: &str = "data:";
const EVENT_FIELD: &str = "event:";

#[derive(Debug)]
pub struct FrameParser {
    /// Decoded text not yet split into records.
    buffer: String,
    /// Tail of a multi-byte sequence split across chunks (at most 3 bytes).
    undecoded: Vec<u8>,
    /// A `\r` ended the previous chunk; it may be the first half of `\r\n`.
    pending_cr: bool,
    decoded_bytes: u64,
    max_record_bytes: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_max_record_bytes(DEFAULT_MAX_RECORD_BYTES)
    }

    pub fn with_max_record_bytes(max_record_bytes: usize) -> Self {
        Self {
            buffer: String::new(),
            undecoded: Vec::new(),
            pending_cr: false,
            decoded_bytes: 0,
            max_record_bytes: max_record_bytes.max(1),
        }
    }

    /// Decodes one chunk and returns every record it completed, in byte order.
    pub fn feed(&mut self, bytes: &[u8]) -> FrameResult<Vec<ChatEvent>> {
        self.decode(bytes)?;
        self.drain_records()
    }

    /// Finishes the stream.
    ///
    /// A trailing record whose last line was terminated is still dispatched; text
    /// cut off mid-line is discarded.
    pub fn flush(&mut self) -> FrameResult<Vec<ChatEvent>> {
        ensure!(
            self.undecoded.is_empty(),
            TruncatedUtf8Snafu {
                stage: "flush-parser",
                pending: self.undecoded.len(),
            }
        );

        if std::mem::take(&mut self.pending_cr) {
            self.buffer.push('\n');
        }

        let mut events = self.drain_records()?;
        let trailing = std::mem::take(&mut self.buffer);

        match trailing.rfind('\n') {
            Some(end) => {
                if end + 1 < trailing.len() {
                    tracing::debug!(
                        discarded_bytes = trailing.len() - end - 1,
                        "discarding unterminated line at end of stream"
                    );
                }
                if let Some(event) = parse_record(&trailing[..end], self.max_record_bytes)? {
                    events.push(event);
                }
            }
            None if !trailing.trim().is_empty() => {
                tracing::debug!(
                    discarded_bytes = trailing.len(),
                    "discarding incomplete record at end of stream"
                );
            }
            None => {}
        }

        Ok(events)
    }

    /// Returns true when no partial record or byte sequence is buffered.
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.undecoded.is_empty() && !self.pending_cr
    }

    fn decode(&mut self, bytes: &[u8]) -> FrameResult<()> {
        self.undecoded.extend_from_slice(bytes);

        let valid_len = match std::str::from_utf8(&self.undecoded) {
            Ok(_) => self.undecoded.len(),
            // A sequence cut by the chunk boundary; keep it until the next chunk.
            Err(error) if error.error_len().is_none() => error.valid_up_to(),
            Err(source) => {
                return Err(FrameError::InvalidUtf8 {
                    stage: "decode-chunk",
                    offset: self.decoded_bytes + source.valid_up_to() as u64,
                    source,
                });
            }
        };

        let text = std::str::from_utf8(&self.undecoded[..valid_len]).context(InvalidUtf8Snafu {
            stage: "decode-valid-prefix",
            offset: self.decoded_bytes,
        })?;
        push_normalized(&mut self.buffer, &mut self.pending_cr, text);

        self.decoded_bytes += valid_len as u64;
        self.undecoded.drain(..valid_len);
        Ok(())
    }

    fn drain_records(&mut self) -> FrameResult<Vec<ChatEvent>> {
        let mut events = Vec::new();
        let mut consumed = 0;

        while let Some(end) = self.buffer[consumed..].find(RECORD_SEPARATOR) {
            let record = &self.buffer[consumed..consumed + end];
            if let Some(event) = parse_record(record, self.max_record_bytes)? {
                events.push(event);
            }
            consumed += end + RECORD_SEPARATOR.len();
        }

        self.buffer.drain(..consumed);
        ensure!(
            self.buffer.len() <= self.max_record_bytes,
            RecordTooLargeSnafu {
                stage: "buffer-partial-record",
                limit: self.max_record_bytes,
                buffered: self.buffer.len(),
            }
        );

        Ok(events)
    }
}

/// Appends `text`, folding `\r\n` and lone `\r` into `\n`.
fn push_normalized(buffer: &mut String, pending_cr: &mut bool, text: &str) {
    if !*pending_cr && !text.contains('\r') {
        buffer.push_str(text);
        return;
    }

    for ch in text.chars() {
        if std::mem::take(pending_cr) {
            buffer.push('\n');
            if ch == '\n' {
                continue;
            }
        }

        if ch == '\r' {
            *pending_cr = true;
        } else {
            buffer.push(ch);
        }
    }
}

fn parse_record(record: &str, max_record_bytes: usize) -> FrameResult<Option<ChatEvent>> {
    if record.trim().is_empty() {
        return Ok(None);
    }

    ensure!(
        record.len() <= max_record_bytes,
        RecordTooLargeSnafu {
            stage: "parse-record",
            limit: max_record_bytes,
            buffered: record.len(),
        }
    );

    let mut event_name = None;
    let mut data_lines = Vec::new();

    for line in record.split('\n') {
        if let Some(value) = line.strip_prefix(DATA_FIELD) {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        } else if let Some(value) = line.strip_prefix(EVENT_FIELD) {
            event_name = Some(value.trim());
        }
    }

    let payload = data_lines.join("\n");

    let event = match event_name.unwrap_or("data") {
        "" | "data" | "message" => (!payload.is_empty()).then(|| ChatEvent::Data(payload)),
        "conversation_id" => {
            let id = payload.trim();
            ensure!(
                !id.is_empty(),
                MalformedRecordSnafu {
                    stage: "parse-conversation-id",
                    details: "conversation_id record carries no id".to_string(),
                }
            );
            Some(ChatEvent::ConversationId(id.to_string()))
        }
        "handoff_status" => match HandoffStatus::parse(&payload) {
            Some(status) => Some(ChatEvent::HandoffStatus(status)),
            None => {
                tracing::warn!(
                    status = %payload,
                    "unknown handoff status; surfacing it as reply text"
                );
                (!payload.is_empty()).then(|| ChatEvent::Data(payload))
            }
        },
        other => {
            tracing::debug!(event = other, "skipping record with unrecognised event name");
            None
        }
    };

    Ok(event)
}
