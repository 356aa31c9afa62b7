use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Discriminant of a run envelope.
///
/// The set is closed: the server emits one of these seven names and the SSE
/// transport subscribes to exactly these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunEventType {
    #[serde(rename = "run.queued")]
    Queued,
    #[serde(rename = "run.started")]
    Started,
    #[serde(rename = "run.progress")]
    Progress,
    #[serde(rename = "run.partial")]
    Partial,
    #[serde(rename = "run.completed")]
    Completed,
    #[serde(rename = "run.failed")]
    Failed,
    #[serde(rename = "run.cancelled")]
    Cancelled,
}

impl RunEventType {
    pub const ALL: [RunEventType; 7] = [
        RunEventType::Queued,
        RunEventType::Started,
        RunEventType::Progress,
        RunEventType::Partial,
        RunEventType::Completed,
        RunEventType::Failed,
        RunEventType::Cancelled,
    ];

    /// Name used on the wire and as the SSE event name.
    pub fn wire_name(self) -> &'static str {
        match self {
            RunEventType::Queued => "run.queued",
            RunEventType::Started => "run.started",
            RunEventType::Progress => "run.progress",
            RunEventType::Partial => "run.partial",
            RunEventType::Completed => "run.completed",
            RunEventType::Failed => "run.failed",
            RunEventType::Cancelled => "run.cancelled",
        }
    }

    /// Parse a wire name. The bare lifecycle name (`completed`) is accepted too,
    /// since older servers dropped the `run.` prefix on the WebSocket path.
    pub fn from_wire(name: &str) -> Option<Self> {
        let bare = name.strip_prefix("run.").unwrap_or(name);
        match bare {
            "queued" => Some(RunEventType::Queued),
            "started" => Some(RunEventType::Started),
            "progress" => Some(RunEventType::Progress),
            "partial" => Some(RunEventType::Partial),
            "completed" => Some(RunEventType::Completed),
            "failed" => Some(RunEventType::Failed),
            "cancelled" | "canceled" => Some(RunEventType::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunEventType::Completed | RunEventType::Failed | RunEventType::Cancelled
        )
    }
}

impl std::fmt::Display for RunEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Canonical run envelope, identical for both transports once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(rename = "type")]
    pub event_type: RunEventType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,

    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl RunEvent {
    pub fn new(run_id: impl Into<String>, event_type: RunEventType) -> Self {
        Self {
            event_id: None,
            run_id: Some(run_id.into()),
            session_id: None,
            event_type,
            seq: None,
            ts: None,
            payload: Map::new(),
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        if let Value::Object(map) = payload {
            self.payload = map;
        }
        self
    }

    /// Run id when present, falling back to the session id.
    pub fn owner_id(&self) -> &str {
        self.run_id
            .as_deref()
            .or(self.session_id.as_deref())
            .unwrap_or_default()
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Normalize a loosely typed timestamp.
///
/// Accepts RFC 3339 strings, unix seconds and unix milliseconds. Values above
/// 10^11 are taken as milliseconds.
pub(crate) fn normalize_ts(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let raw = n.as_f64()?;
            if raw < 0.0 {
                return None;
            }
            let millis = if raw > 1e11 { raw } else { raw * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}
