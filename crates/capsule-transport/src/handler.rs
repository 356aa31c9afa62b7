//! Callback surface between a transport and its consumer

use crate::control::TransportKind;
use capsule_core::{Error, RunEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Receives everything a run stream produces.
///
/// Decode and transport problems arrive through `on_error`; nothing is ever
/// raised into the caller. `on_close` fires exactly once per connection.
pub trait RunHandler: Send + Sync {
    fn on_open(&self, _transport: TransportKind) {}
    fn on_event(&self, event: RunEvent);
    fn on_error(&self, _error: Error) {}
    fn on_close(&self) {}
}

/// Handler callbacks as values, for consumers that own their state.
#[derive(Debug)]
pub enum StreamSignal {
    Opened(TransportKind),
    Event(RunEvent),
    Error(Error),
    Closed,
}

/// Forwards callbacks into an unbounded channel.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<StreamSignal>,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::UnboundedSender<StreamSignal>) -> Self {
        Self { tx }
    }

    fn send(&self, signal: StreamSignal) {
        // The receiver is gone once the consumer discarded the run.
        if self.tx.send(signal).is_err() {
            tracing::trace!("Dropping stream signal, receiver closed");
        }
    }
}

impl RunHandler for ChannelHandler {
    fn on_open(&self, transport: TransportKind) {
        self.send(StreamSignal::Opened(transport));
    }

    fn on_event(&self, event: RunEvent) {
        self.send(StreamSignal::Event(event));
    }

    fn on_error(&self, error: Error) {
        self.send(StreamSignal::Error(error));
    }

    fn on_close(&self) {
        self.send(StreamSignal::Closed);
    }
}

/// A fresh handler/receiver pair for one run.
pub fn signal_channel() -> (Arc<ChannelHandler>, mpsc::UnboundedReceiver<StreamSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelHandler::new(tx)), rx)
}

/// Wraps a handler with the close guarantees every transport shares: no
/// delivery after close, and a single `on_close`.
pub(crate) struct Delivery {
    handler: Arc<dyn RunHandler>,
    closed: AtomicBool,
}

impl Delivery {
    pub(crate) fn new(handler: Arc<dyn RunHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn open(&self, transport: TransportKind) {
        if !self.is_closed() {
            self.handler.on_open(transport);
        }
    }

    pub(crate) fn event(&self, event: RunEvent) {
        if !self.is_closed() {
            self.handler.on_event(event);
        }
    }

    pub(crate) fn error(&self, error: Error) {
        if self.is_closed() {
            return;
        }
        tracing::warn!(%error, "Run stream error");
        self.handler.on_error(error);
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.handler.on_close();
        }
    }
}
