//! Event bodies and the single-send batch.

use std::io::{self, Write};

use serde_json::Value;
use serde_json::ser::{Formatter, Serializer};
use serde::Serialize;
use thiserror::Error;

/// Largest batch the standard tier accepts.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 1_048_576;

/// The payload could not be turned into a message body.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Serialization failed.
    #[error("failed to serialize payload as JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The serializer produced invalid UTF-8.
    #[error("serialized payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Compact JSON with `", "` between items and `": "` after keys. Strings
/// are pure ASCII: anything outside the printable range is written as
/// lowercase `\uXXXX` escapes, astral characters as surrogate pairs.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (index, ch) in fragment.char_indices() {
            if ch.is_ascii() && ch != '\x7f' {
                continue;
            }
            writer.write_all(fragment[start..index].as_bytes())?;
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            start = index + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }
}

/// Serializes `payload` to the message body.
///
/// Key order is the order the source sent (`serde_json` is built with
/// `preserve_order`), so `{"temp": 72, "unit": "F"}` encodes to exactly that
/// text, and `{"city": "Zürich"}` to `{"city": "Z\u00fcrich"}`. Decoding
/// the result yields a value equal to `payload`.
pub fn encode_payload(payload: &Value) -> Result<String, EncodeError> {
    let mut buf = Vec::with_capacity(128);
    let mut serializer = Serializer::with_formatter(&mut buf, SpacedFormatter);
    payload.serialize(&mut serializer)?;
    Ok(String::from_utf8(buf)?)
}

/// One event. The body is UTF-8 JSON text; nothing else is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    body: String,
}

impl EventData {
    /// Wraps an already encoded body.
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    /// Encodes `payload` into a new event.
    pub fn from_json(payload: &Value) -> Result<Self, EncodeError> {
        encode_payload(payload).map(Self::new)
    }

    /// Body text.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Body size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.body.len()
    }
}

/// How a transport frames events on the wire, so a batch can be sized by
/// what is actually sent rather than by body text alone.
#[derive(Debug, Clone, Copy)]
pub struct WireFormat {
    /// Bytes the batch envelope adds once, whatever the event count.
    pub batch_overhead: usize,
    /// Bytes one event occupies inside the envelope, separators included.
    pub event_size: fn(&EventData) -> usize,
}

impl WireFormat {
    /// Body bytes only, for transports without framing.
    pub const RAW: WireFormat = WireFormat {
        batch_overhead: 0,
        event_size: EventData::size_bytes,
    };
}

/// Events submitted together in one send.
#[derive(Debug, Clone)]
pub struct EventBatch {
    events: Vec<EventData>,
    size_bytes: usize,
    max_size_bytes: usize,
    format: WireFormat,
}

impl EventBatch {
    /// An empty batch capped at `max_size_bytes` of body data.
    pub fn new(max_size_bytes: usize) -> Self {
        Self::with_format(max_size_bytes, WireFormat::RAW)
    }

    /// An empty batch capped at `max_size_bytes` as framed by `format`.
    pub fn with_format(max_size_bytes: usize, format: WireFormat) -> Self {
        Self {
            events: Vec::new(),
            size_bytes: format.batch_overhead,
            max_size_bytes,
            format,
        }
    }

    /// Wire size of the batch if `event` were added.
    pub fn size_with(&self, event: &EventData) -> usize {
        self.size_bytes + (self.format.event_size)(event)
    }

    /// Adds `event`, handing it back if it would overflow the batch.
    pub fn try_add(&mut self, event: EventData) -> Result<(), EventData> {
        let size = self.size_with(&event);
        if size > self.max_size_bytes {
            return Err(event);
        }
        self.size_bytes = size;
        self.events.push(event);
        Ok(())
    }

    /// Events in insertion order.
    pub fn events(&self) -> &[EventData] {
        &self.events
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing was added.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total wire bytes, envelope included.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// The configured cap.
    pub fn max_size_bytes(&self) -> usize {
        self.max_size_bytes
    }
}
