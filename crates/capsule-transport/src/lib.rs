//! Run stream transports
//!
//! One live connection per run. WebSocket is preferred; Server-Sent-Events is
//! the fallback. Callers only see [`RunController`] and the [`RunHandler`]
//! callbacks, never the concrete transport.

pub mod cancel;
pub mod control;
pub mod endpoints;
pub mod handler;
pub mod http;
pub mod manager;
pub mod sse;
pub mod websocket;

pub use cancel::{CancelChannel, HttpCanceller};
pub use control::{ControlFrame, ReadyState, SUBSCRIBED_EVENTS, TransportKind};
pub use endpoints::Endpoints;
pub use handler::{ChannelHandler, RunHandler, StreamSignal, signal_channel};
pub use manager::{ConnectionManager, Connector, RunConnection, RunController, Transport};
pub use sse::SseTransport;
pub use websocket::WebSocketTransport;
