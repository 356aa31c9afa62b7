//! Side-channel HTTP cancellation

use crate::endpoints::Endpoints;
use crate::http::{authorized, expect_success, transport_error};
use async_trait::async_trait;
use capsule_core::Result;
use std::sync::Arc;

/// Out-of-band cancellation of a run.
///
/// Used by SSE always, and by WebSocket when the socket is not open.
#[async_trait]
pub trait CancelChannel: Send + Sync {
    async fn cancel_run(&self, run_id: &str) -> Result<()>;
}

/// `POST /api/v1/capsules/run/{run_id}/cancel`
pub struct HttpCanceller {
    client: reqwest::Client,
    endpoints: Arc<Endpoints>,
}

impl HttpCanceller {
    pub fn new(client: reqwest::Client, endpoints: Arc<Endpoints>) -> Self {
        Self { client, endpoints }
    }
}

#[async_trait]
impl CancelChannel for HttpCanceller {
    async fn cancel_run(&self, run_id: &str) -> Result<()> {
        let url = self.endpoints.cancel_url(run_id);
        tracing::debug!(%run_id, %url, "Requesting cancellation over HTTP");

        let response = authorized(self.client.post(url), self.endpoints.token())
            .send()
            .await
            .map_err(|e| transport_error("Cancel request failed", e))?;
        expect_success(response).await?;
        Ok(())
    }
}
