//! Transport selection and the uniform run controller

use crate::cancel::{CancelChannel, HttpCanceller};
use crate::control::TransportKind;
use crate::endpoints::Endpoints;
use crate::handler::RunHandler;
use crate::sse::SseTransport;
use crate::websocket::WebSocketTransport;
use async_trait::async_trait;
use capsule_core::{ClientConfig, Result};
use std::sync::Arc;

/// One live connection for one run.
#[async_trait]
pub trait RunConnection: Send + Sync {
    fn transport(&self) -> TransportKind;

    fn run_id(&self) -> &str;

    /// Request termination. Cooperative: the run is finished only once a
    /// terminal event or the close callback is observed.
    async fn cancel(&self) -> Result<()>;

    /// Stop the subscription. Idempotent; `on_close` fires once.
    async fn close(&self);
}

/// A way of opening run connections.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Start streaming `run_id` in the background. Must be called inside a
    /// tokio runtime.
    fn open(&self, run_id: &str, handler: Arc<dyn RunHandler>) -> Box<dyn RunConnection>;
}

/// `{close, cancel, transport}` for one run, independent of the transport.
pub struct RunController {
    connection: Box<dyn RunConnection>,
}

impl RunController {
    pub fn new(connection: Box<dyn RunConnection>) -> Self {
        Self { connection }
    }

    pub fn transport(&self) -> TransportKind {
        self.connection.transport()
    }

    pub fn run_id(&self) -> &str {
        self.connection.run_id()
    }

    pub async fn cancel(&self) -> Result<()> {
        self.connection.cancel().await
    }

    pub async fn close(&self) {
        self.connection.close().await
    }
}

impl std::fmt::Debug for RunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunController")
            .field("run_id", &self.run_id())
            .field("transport", &self.transport())
            .finish()
    }
}

/// What the session layer depends on to open runs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, run_id: &str, handler: Arc<dyn RunHandler>) -> Result<RunController>;
}

/// Picks WebSocket when it is enabled and a WebSocket base can be derived,
/// SSE otherwise. The choice is fixed for a controller's lifetime.
pub struct ConnectionManager {
    websocket: Option<WebSocketTransport>,
    sse: SseTransport,
}

impl ConnectionManager {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let endpoints = Arc::new(Endpoints::from_config(&config.api)?);
        let client = reqwest::Client::new();
        let canceller: Arc<dyn CancelChannel> =
            Arc::new(HttpCanceller::new(client.clone(), endpoints.clone()));
        Ok(Self::with_parts(
            endpoints,
            client,
            canceller,
            config.transport.prefer_websocket,
        ))
    }

    pub fn with_parts(
        endpoints: Arc<Endpoints>,
        client: reqwest::Client,
        canceller: Arc<dyn CancelChannel>,
        prefer_websocket: bool,
    ) -> Self {
        let websocket = (prefer_websocket && endpoints.ws_base().is_some())
            .then(|| WebSocketTransport::new(endpoints.clone(), canceller.clone()));
        let sse = SseTransport::new(endpoints, client, canceller);
        Self { websocket, sse }
    }

    pub fn selected_transport(&self) -> TransportKind {
        self.transport().kind()
    }

    fn transport(&self) -> &dyn Transport {
        match &self.websocket {
            Some(ws) => ws as &dyn Transport,
            None => &self.sse,
        }
    }

    /// Open a controller for `run_id`.
    pub fn open_run(&self, run_id: &str, handler: Arc<dyn RunHandler>) -> RunController {
        let transport = self.transport();
        tracing::info!(%run_id, transport = %transport.kind(), "Opening run stream");
        RunController::new(transport.open(run_id, handler))
    }
}

#[async_trait]
impl Connector for ConnectionManager {
    async fn open(&self, run_id: &str, handler: Arc<dyn RunHandler>) -> Result<RunController> {
        Ok(self.open_run(run_id, handler))
    }
}
