use capsule_core::{ToolCall, WorkflowPlan, parse_tool_calls};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
    Approved,
    Rejected,
}

impl SessionStatus {
    /// Loose parse of a server status string.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "idle" | "pending" => Some(SessionStatus::Idle),
            "running" | "queued" | "started" | "progress" | "partial" | "in_progress" => {
                Some(SessionStatus::Running)
            }
            "completed" | "complete" | "succeeded" | "done" => Some(SessionStatus::Completed),
            "failed" | "error" => Some(SessionStatus::Failed),
            "cancelled" | "canceled" => Some(SessionStatus::Cancelled),
            "approved" => Some(SessionStatus::Approved),
            "rejected" => Some(SessionStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Streaming,
    Complete,
    Error,
    Cancelled,
}

impl MessageStatus {
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "streaming" | "pending" | "running" => Some(MessageStatus::Streaming),
            "complete" | "completed" | "success" | "ok" => Some(MessageStatus::Complete),
            "error" | "failed" => Some(MessageStatus::Error),
            "cancelled" | "canceled" => Some(MessageStatus::Cancelled),
            _ => None,
        }
    }
}

/// One entry of the chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum AgentMessage {
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
        status: MessageStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Tool {
        name: String,
        output: Value,
        status: MessageStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl AgentMessage {
    pub fn user(content: impl Into<String>) -> Self {
        AgentMessage::User {
            content: content.into(),
        }
    }

    /// Empty assistant turn waiting for a run's events.
    pub fn streaming(run_id: impl Into<String>) -> Self {
        AgentMessage::Assistant {
            content: String::new(),
            tool_calls: Vec::new(),
            status: MessageStatus::Streaming,
            run_id: Some(run_id.into()),
            error: None,
        }
    }

    /// Build a tool message from a `tool_result` payload.
    pub fn tool_result(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let error = string_field(obj, "error");
        let status = obj
            .get("status")
            .and_then(Value::as_str)
            .and_then(MessageStatus::from_wire)
            .unwrap_or(if error.is_some() {
                MessageStatus::Error
            } else {
                MessageStatus::Complete
            });

        Some(AgentMessage::Tool {
            name: string_field(obj, "name")
                .or_else(|| string_field(obj, "tool"))
                .unwrap_or_else(|| "tool".to_string()),
            output: obj
                .get("output")
                .or_else(|| obj.get("result"))
                .cloned()
                .unwrap_or(Value::Null),
            status,
            error,
        })
    }

    /// Normalize a message from a stored session. Unknown roles yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let content = string_field(obj, "content").unwrap_or_default();
        let status = obj
            .get("status")
            .and_then(Value::as_str)
            .and_then(MessageStatus::from_wire);

        match obj.get("role").and_then(Value::as_str)? {
            "user" => Some(AgentMessage::User { content }),
            "assistant" => Some(AgentMessage::Assistant {
                content,
                tool_calls: obj
                    .get("tool_calls")
                    .map(parse_tool_calls)
                    .unwrap_or_default(),
                status: status.unwrap_or(MessageStatus::Complete),
                run_id: string_field(obj, "run_id"),
                error: string_field(obj, "error"),
            }),
            "tool" => {
                let mut message = Self::tool_result(value)?;
                if let (AgentMessage::Tool { output, .. }, Some(raw)) =
                    (&mut message, obj.get("content"))
                    && output.is_null()
                {
                    *output = raw.clone();
                }
                Some(message)
            }
            other => {
                tracing::warn!(role = other, "Skipping message with unknown role");
                None
            }
        }
    }
}

/// A generated scene as reported by partial events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneSnapshot {
    pub scene_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Everything else the server sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const SCENE_FIELDS: [&str; 8] = [
    "scene_id", "id", "index", "title", "prompt", "media_url", "url", "status",
];

impl SceneSnapshot {
    /// Accepts `scene_id` or `id` (string or integer). Anything without an id
    /// is dropped with a warning.
    pub fn from_value(value: &Value) -> Option<Self> {
        let Some(obj) = value.as_object() else {
            tracing::warn!("Dropping scene that is not an object");
            return None;
        };

        let scene_id = match obj.get("scene_id").or_else(|| obj.get("id")) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                tracing::warn!("Dropping scene without an id");
                return None;
            }
        };

        let extra = obj
            .iter()
            .filter(|(key, _)| !SCENE_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Some(Self {
            scene_id,
            index: obj.get("index").and_then(Value::as_u64),
            title: string_field(obj, "title"),
            prompt: string_field(obj, "prompt"),
            media_url: string_field(obj, "media_url").or_else(|| string_field(obj, "url")),
            status: string_field(obj, "status"),
            extra,
        })
    }
}

/// Per-message overrides for `send_message`.
#[derive(Debug, Clone, Default)]
pub struct SendOverrides {
    pub agent_model: Option<String>,
    pub capsule_id: Option<String>,
    pub inputs: Map<String, Value>,
}

/// The conversation state owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Option<String>,
    pub status: SessionStatus,
    pub agent_model: String,
    pub capsule_id: Option<String>,
    pub messages: Vec<AgentMessage>,
    pub scenes: Vec<SceneSnapshot>,
    /// Most recent plan coerced from a tool output.
    pub latest_plan: Option<WorkflowPlan>,
    pub progress: Option<f64>,
}

impl Session {
    pub fn new(agent_model: impl Into<String>) -> Self {
        Self {
            session_id: None,
            status: SessionStatus::Idle,
            agent_model: agent_model.into(),
            capsule_id: None,
            messages: Vec::new(),
            scenes: Vec::new(),
            latest_plan: None,
            progress: None,
        }
    }

    /// Append a scene unless one with the same id is already present.
    pub fn push_scene(&mut self, scene: SceneSnapshot) -> bool {
        if self.scenes.iter().any(|s| s.scene_id == scene.scene_id) {
            tracing::debug!(scene_id = %scene.scene_id, "Skipping duplicate scene");
            return false;
        }
        self.scenes.push(scene);
        true
    }

    pub fn last_message(&self) -> Option<&AgentMessage> {
        self.messages.last()
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}
