//! Wire-level control types shared by the transports

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// SSE event names the stream subscription listens to. Blocks with any other
/// name are skipped.
pub const SUBSCRIBED_EVENTS: [&str; 7] = [
    "run.queued",
    "run.started",
    "run.progress",
    "run.partial",
    "run.completed",
    "run.failed",
    "run.cancelled",
];

/// Messages sent from client to server over the WebSocket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Ask the server to stop the run. Serializes to `{"type":"cancel"}`.
    Cancel,
}

/// Which transport a controller is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    WebSocket,
    Sse,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::WebSocket => capsule_telemetry::attributes::TRANSPORT_WEBSOCKET,
            TransportKind::Sse => capsule_telemetry::attributes::TRANSPORT_SSE,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket ready state, mirrored in an atomic so `cancel()` can pick the
/// in-band or side-channel path without locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    pub(crate) fn load(cell: &AtomicU8) -> Self {
        match cell.load(Ordering::Acquire) {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    pub(crate) fn store(self, cell: &AtomicU8) {
        cell.store(self as u8, Ordering::Release);
    }
}

pub(crate) fn is_subscribed(name: &str) -> bool {
    SUBSCRIBED_EVENTS.contains(&name)
}
