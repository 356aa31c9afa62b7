//! Core types for the capsule run-streaming client
//!
//! This crate holds everything that does not touch the network: the canonical
//! run envelope and its decoder, tool-call assembly, workflow plan coercion and
//! the per-run lifecycle state machine.

pub mod config;
pub mod decode;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod plan;
pub mod tool_call;

// Re-exports
pub use config::{ApiConfig, ClientConfig, ObservabilityConfig, SessionConfig, TransportConfig};
pub use decode::{
    DecodeError, SseBlock, SseParser, decode_sse_block, decode_sse_block_or_report,
    decode_ws_frame, decode_ws_frame_or_report,
};
pub use error::{Error, Result};
pub use event::{RunEvent, RunEventType};
pub use lifecycle::{Applied, IgnoreReason, RunLifecycle, RunState};
pub use plan::{Edge, Node, Position, WorkflowPlan, coerce_plan};
pub use tool_call::{ToolCall, ToolCallAssembler, merge_tool_calls, parse_tool_calls};
