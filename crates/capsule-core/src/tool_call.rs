//! Tool-call assembly for streaming assistant turns
//!
//! Servers commonly re-send the full set of tool calls on every chunk. Merging
//! keeps the first-seen order and drops later emissions of an id already seen.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: Map::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        if let Value::Object(map) = arguments {
            self.arguments = map;
        }
        self
    }

    /// Normalize one loosely shaped tool call.
    ///
    /// `arguments` may be an object, a JSON-encoded object string, or absent.
    /// The OpenAI-style `{"function": {"name", "arguments"}}` nesting is
    /// flattened. Returns `None` when there is no string id.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let id = obj.get("id").and_then(Value::as_str)?.to_string();
        let function = obj.get("function").and_then(Value::as_object);

        let name = obj
            .get("name")
            .or_else(|| function.and_then(|f| f.get("name")))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let raw_args = obj
            .get("arguments")
            .or_else(|| obj.get("args"))
            .or_else(|| function.and_then(|f| f.get("arguments")));

        let arguments = match raw_args {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            },
            _ => Map::new(),
        };

        Some(Self {
            id,
            name,
            arguments,
        })
    }
}

/// Parse a payload value that should hold a list of tool calls.
///
/// Entries failing the shape check are dropped with a warning.
pub fn parse_tool_calls(value: &Value) -> Vec<ToolCall> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let call = ToolCall::from_value(item);
            if call.is_none() {
                tracing::warn!("Dropping tool call without a string id");
            }
            call
        })
        .collect()
}

/// Merge incoming tool calls into the current list.
pub fn merge_tool_calls(current: &[ToolCall], incoming: &[ToolCall]) -> Vec<ToolCall> {
    if incoming.is_empty() {
        return current.to_vec();
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut merged = Vec::with_capacity(current.len() + incoming.len());
    for call in current.iter().chain(incoming) {
        if seen.insert(call.id.as_str()) {
            merged.push(call.clone());
        }
    }
    merged
}

/// Owns the tool-call list of one assistant turn.
#[derive(Debug, Clone, Default)]
pub struct ToolCallAssembler {
    calls: Vec<ToolCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a chunk; returns whether anything new was added.
    pub fn absorb(&mut self, incoming: &[ToolCall]) -> bool {
        let before = self.calls.len();
        self.calls = merge_tool_calls(&self.calls, incoming);
        self.calls.len() != before
    }

    pub fn calls(&self) -> &[ToolCall] {
        &self.calls
    }

    pub fn reset(&mut self) {
        self.calls.clear();
    }
}
