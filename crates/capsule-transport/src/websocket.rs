//! WebSocket run stream (`/ws/runs/{run_id}`)

use crate::cancel::CancelChannel;
use crate::control::{ControlFrame, ReadyState, TransportKind};
use crate::endpoints::Endpoints;
use crate::handler::{Delivery, RunHandler};
use crate::http::transport_error;
use crate::manager::{RunConnection, Transport};
use async_trait::async_trait;
use capsule_core::{Result, decode_ws_frame_or_report};
use futures::{Sink, SinkExt, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use tokio::sync::Mutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use url::Url;

type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

pub struct WebSocketTransport {
    endpoints: Arc<Endpoints>,
    canceller: Arc<dyn CancelChannel>,
}

impl WebSocketTransport {
    pub fn new(endpoints: Arc<Endpoints>, canceller: Arc<dyn CancelChannel>) -> Self {
        Self {
            endpoints,
            canceller,
        }
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn open(&self, run_id: &str, handler: Arc<dyn RunHandler>) -> Box<dyn RunConnection> {
        let connection = WsConnection::new(run_id, self.canceller.clone(), handler);

        match self.endpoints.ws_url(run_id) {
            Some(url) => {
                let span = capsule_telemetry::run_span(run_id, TransportKind::WebSocket.as_str());
                tokio::spawn(
                    run_socket(
                        url,
                        self.endpoints.token().map(str::to_string),
                        connection.state.clone(),
                        connection.sink.clone(),
                        connection.delivery.clone(),
                        connection.shutdown.clone(),
                    )
                    .instrument(span),
                );
            }
            None => {
                // The manager only builds this transport when a base exists.
                connection
                    .delivery
                    .error(capsule_core::Error::transport("No WebSocket URL for run"));
                ReadyState::Closed.store(&connection.state);
                connection.delivery.close();
            }
        }

        Box::new(connection)
    }
}

pub struct WsConnection {
    run_id: String,
    state: Arc<AtomicU8>,
    sink: Arc<Mutex<Option<WsSink>>>,
    canceller: Arc<dyn CancelChannel>,
    delivery: Arc<Delivery>,
    shutdown: CancellationToken,
}

impl WsConnection {
    fn new(run_id: &str, canceller: Arc<dyn CancelChannel>, handler: Arc<dyn RunHandler>) -> Self {
        Self {
            run_id: run_id.to_string(),
            state: Arc::new(AtomicU8::new(ReadyState::Connecting as u8)),
            sink: Arc::new(Mutex::new(None)),
            canceller,
            delivery: Delivery::new(handler),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::load(&self.state)
    }

    /// Try the in-band cancel frame. Returns false when the socket is not
    /// open or the send failed.
    async fn send_cancel_frame(&self) -> bool {
        if self.ready_state() != ReadyState::Open {
            return false;
        }

        let mut slot = self.sink.lock().await;
        let Some(sink) = slot.as_mut() else {
            return false;
        };

        let frame = match serde_json::to_string(&ControlFrame::Cancel) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to serialize cancel frame: {}", e);
                return false;
            }
        };

        match sink.send(Message::Text(frame.into())).await {
            Ok(()) => {
                tracing::debug!(run_id = %self.run_id, "Sent in-band cancel");
                true
            }
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, "In-band cancel failed, using HTTP: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl RunConnection for WsConnection {
    fn transport(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn run_id(&self) -> &str {
        &self.run_id
    }

    async fn cancel(&self) -> Result<()> {
        if self.send_cancel_frame().await {
            return Ok(());
        }
        self.canceller.cancel_run(&self.run_id).await
    }

    async fn close(&self) {
        if self.ready_state() != ReadyState::Closed {
            ReadyState::Closing.store(&self.state);
        }
        self.shutdown.cancel();
        self.delivery.close();
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Upgrade request for `url`, carrying the same bearer token the HTTP
/// side channel sends.
pub(crate) fn handshake_request(url: &Url, token: Option<&str>) -> Result<Request> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| transport_error("Invalid WebSocket URL", e))?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| transport_error("Invalid API token", e))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

async fn run_socket(
    url: Url,
    token: Option<String>,
    state: Arc<AtomicU8>,
    sink_slot: Arc<Mutex<Option<WsSink>>>,
    delivery: Arc<Delivery>,
    shutdown: CancellationToken,
) {
    let request = match handshake_request(&url, token.as_deref()) {
        Ok(request) => request,
        Err(e) => {
            ReadyState::Closed.store(&state);
            delivery.error(e);
            delivery.close();
            return;
        }
    };

    let connected = tokio::select! {
        _ = shutdown.cancelled() => {
            ReadyState::Closed.store(&state);
            delivery.close();
            return;
        }
        result = connect_async(request) => result,
    };

    let (stream, _) = match connected {
        Ok(pair) => pair,
        Err(e) => {
            ReadyState::Closed.store(&state);
            delivery.error(transport_error("WebSocket connect failed", e));
            delivery.close();
            return;
        }
    };

    let (write, mut read) = stream.split();
    let write: WsSink = Box::pin(write);
    *sink_slot.lock().await = Some(write);
    if ReadyState::load(&state) == ReadyState::Connecting {
        ReadyState::Open.store(&state);
    }
    delivery.open(TransportKind::WebSocket);

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = read.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => deliver_frame(&delivery, text.as_str()),
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => deliver_frame(&delivery, text),
                Err(e) => delivery.error(capsule_core::Error::Decode(format!(
                    "binary frame is not UTF-8: {}",
                    e
                ))),
            },
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(?frame, "Server closed the socket");
                break;
            }
            // Ping/pong are answered by tungstenite.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                delivery.error(transport_error("WebSocket error", e));
                break;
            }
            None => break,
        }
    }

    ReadyState::Closing.store(&state);
    if let Some(mut sink) = sink_slot.lock().await.take() {
        let _ = sink.close().await;
    }
    ReadyState::Closed.store(&state);
    delivery.close();
}

fn deliver_frame(delivery: &Delivery, frame: &str) {
    tracing::trace!(frame, "WebSocket frame");
    if let Some(event) = decode_ws_frame_or_report(frame, |e| delivery.error(e.into())) {
        delivery.event(event);
    }
}
