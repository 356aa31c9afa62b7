//! JSON-over-HTTP collaborator endpoints used by the orchestrator

use crate::SessionApi;
use async_trait::async_trait;
use capsule_core::{ClientConfig, Result};
use capsule_transport::Endpoints;
use capsule_transport::http::{authorized, expect_success};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Body of `POST /api/v1/capsules/run`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub message: String,
    pub agent_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capsule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
}

/// Response of run creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// A stored session as returned by `GET /api/v1/agent/sessions/{id}`.
///
/// Messages and scenes stay raw here; the orchestrator normalizes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(alias = "id")]
    pub session_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub agent_model: Option<String>,
    #[serde(default)]
    pub capsule_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub scenes: Vec<Value>,
    /// Run still streaming for this session, if any.
    #[serde(default, alias = "run_id")]
    pub active_run_id: Option<String>,
}

pub struct HttpSessionApi {
    client: reqwest::Client,
    endpoints: Arc<Endpoints>,
}

impl HttpSessionApi {
    pub fn new(client: reqwest::Client, endpoints: Arc<Endpoints>) -> Self {
        Self { client, endpoints }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let endpoints = Arc::new(Endpoints::from_config(&config.api)?);
        Ok(Self::new(reqwest::Client::new(), endpoints))
    }

    fn get(&self, segments: &[&str]) -> RequestBuilder {
        authorized(
            self.client.get(self.endpoints.api_url(segments)),
            self.endpoints.token(),
        )
    }

    fn post(&self, segments: &[&str]) -> RequestBuilder {
        authorized(
            self.client.post(self.endpoints.api_url(segments)),
            self.endpoints.token(),
        )
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.map_err(request_error)?;
        let response = expect_success(response).await?;
        let bytes = response.bytes().await.map_err(request_error)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<()> {
        let response = request.send().await.map_err(request_error)?;
        expect_success(response).await?;
        Ok(())
    }

    async fn decide(&self, session_id: &str, action: &str, note: Option<&str>) -> Result<()> {
        tracing::info!(%session_id, action, "Submitting session decision");
        let request = self
            .post(&["agent", "sessions", session_id, action])
            .json(&json!({ "note": note }));
        self.send_empty(request).await
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_run(&self, request: &CreateRunRequest) -> Result<RunHandle> {
        self.send_json(self.post(&["capsules", "run"]).json(request))
            .await
    }

    async fn fetch_run(&self, run_id: &str) -> Result<Value> {
        self.send_json(self.get(&["capsules", "run", run_id])).await
    }

    async fn fetch_capsule(&self, capsule_id: &str) -> Result<Value> {
        self.send_json(self.get(&["capsules", capsule_id])).await
    }

    async fn fetch_session(&self, session_id: &str) -> Result<SessionRecord> {
        self.send_json(self.get(&["agent", "sessions", session_id]))
            .await
    }

    async fn approve_session(&self, session_id: &str, note: Option<&str>) -> Result<()> {
        self.decide(session_id, "approve", note).await
    }

    async fn reject_session(&self, session_id: &str, note: Option<&str>) -> Result<()> {
        self.decide(session_id, "reject", note).await
    }
}

fn request_error(err: reqwest::Error) -> capsule_core::Error {
    capsule_core::Error::transport(format!("Request failed: {}", err))
}
