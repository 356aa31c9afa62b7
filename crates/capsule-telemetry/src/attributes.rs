//! Span and field names shared by the client crates

pub const SYSTEM_NAME: &str = "capsule";

pub const RUN_STREAM_SPAN: &str = "run_stream";
pub const RUN_OUTCOME_SPAN: &str = "run_outcome";

pub const TRANSPORT_WEBSOCKET: &str = "websocket";
pub const TRANSPORT_SSE: &str = "sse";
