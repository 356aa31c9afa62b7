//! Envelope decoding for both transports
//!
//! WebSocket frames are a single JSON document. Server-Sent-Event blocks are one
//! or more `data:` lines terminated by a blank line; multi-line data is joined
//! with `\n` before parsing. Both paths share the same shape check, and neither
//! ever panics on bad input: failures come back as [`DecodeError`].

use crate::event::{RunEvent, RunEventType, normalize_ts};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("missing or non-string field `{0}`")]
    MissingField(&'static str),

    #[error("unknown event type `{0}`")]
    UnknownType(String),

    #[error("SSE block carries no data lines")]
    EmptyBlock,
}

impl From<DecodeError> for crate::Error {
    fn from(err: DecodeError) -> Self {
        crate::Error::Decode(err.to_string())
    }
}

/// Decode a WebSocket text frame.
pub fn decode_ws_frame(frame: &str) -> Result<RunEvent, DecodeError> {
    let value: Value = serde_json::from_str(frame)?;
    decode_value(value)
}

/// Decode a complete SSE block (`data:` lines, optionally `event:`/`id:` lines).
pub fn decode_sse_block(block: &str) -> Result<RunEvent, DecodeError> {
    let mut builder = BlockBuilder::default();
    let mut parsed = None;
    for line in block.lines() {
        if let Some(done) = builder.feed_line(line) {
            parsed = Some(done);
            break;
        }
    }
    parsed
        .or_else(|| builder.take())
        .unwrap_or_default()
        .decode()
}

/// Decode a WebSocket frame, reporting failure through `on_error` instead of
/// returning it.
pub fn decode_ws_frame_or_report(
    frame: &str,
    on_error: impl FnOnce(DecodeError),
) -> Option<RunEvent> {
    match decode_ws_frame(frame) {
        Ok(event) => Some(event),
        Err(e) => {
            on_error(e);
            None
        }
    }
}

/// Decode an SSE block, reporting failure through `on_error` instead of
/// returning it.
pub fn decode_sse_block_or_report(
    block: &str,
    on_error: impl FnOnce(DecodeError),
) -> Option<RunEvent> {
    match decode_sse_block(block) {
        Ok(event) => Some(event),
        Err(e) => {
            on_error(e);
            None
        }
    }
}

fn decode_value(value: Value) -> Result<RunEvent, DecodeError> {
    let Value::Object(mut obj) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let type_name = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField("type"))?;
    let event_type = RunEventType::from_wire(type_name)
        .ok_or_else(|| DecodeError::UnknownType(type_name.to_string()))?;

    let run_id = string_field(&obj, "run_id");
    let session_id = string_field(&obj, "session_id");
    if run_id.is_none() && session_id.is_none() {
        return Err(DecodeError::MissingField("run_id"));
    }

    // Ids occasionally arrive as numbers from older workers.
    let event_id = match obj.get("event_id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let seq = obj.get("seq").and_then(Value::as_u64);
    let ts = obj.get("ts").and_then(normalize_ts);

    let payload = match obj.remove("payload") {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            tracing::debug!(event_type = %event_type, "Wrapping non-object payload");
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };

    Ok(RunEvent {
        event_id,
        run_id,
        session_id,
        event_type,
        seq,
        ts,
        payload,
    })
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// One complete SSE block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseBlock {
    /// Value of the `event:` line, if any.
    pub event: Option<String>,
    /// Value of the last `id:` line, if any.
    pub id: Option<String>,
    /// Data lines joined with `\n`.
    pub data: String,
    data_lines: usize,
}

impl SseBlock {
    pub fn has_data(&self) -> bool {
        self.data_lines > 0
    }

    pub fn decode(&self) -> Result<RunEvent, DecodeError> {
        if !self.has_data() {
            return Err(DecodeError::EmptyBlock);
        }
        let value: Value = serde_json::from_str(&self.data)?;
        decode_value(value)
    }
}

#[derive(Debug, Default)]
struct BlockBuilder {
    block: SseBlock,
    touched: bool,
}

impl BlockBuilder {
    /// Feed one line without its terminator. Returns a block when the line is
    /// the blank separator.
    fn feed_line(&mut self, line: &str) -> Option<SseBlock> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return self.take();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                if self.block.data_lines > 0 {
                    self.block.data.push('\n');
                }
                self.block.data.push_str(value);
                self.block.data_lines += 1;
            }
            "event" => self.block.event = Some(value.to_string()),
            "id" => self.block.id = Some(value.to_string()),
            // retry and unknown fields
            _ => {}
        }
        self.touched = true;
        None
    }

    fn take(&mut self) -> Option<SseBlock> {
        if !self.touched {
            return None;
        }
        self.touched = false;
        Some(std::mem::take(&mut self.block))
    }
}

/// Incremental SSE parser.
///
/// Bytes can be pushed in arbitrary chunks; a multi-byte character split across
/// two chunks is reassembled because lines are only decoded once complete.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    builder: BlockBuilder,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk and collect every block it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseBlock> {
        self.pending.extend_from_slice(chunk);

        let mut blocks = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.pending[start..end]);
            if let Some(block) = self.builder.feed_line(&line) {
                blocks.push(block);
            }
            start = end + 1;
        }
        self.pending.drain(..start);
        blocks
    }

    /// Bytes buffered without a line terminator yet.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
