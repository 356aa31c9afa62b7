//! Session orchestration for capsule runs

use async_trait::async_trait;
use capsule_core::Result;
use serde_json::Value;

pub mod api;
pub mod orchestrator;
pub mod types;

pub use api::{CreateRunRequest, HttpSessionApi, RunHandle, SessionRecord};
pub use orchestrator::{SessionOrchestrator, SessionUpdate};
pub use types::{AgentMessage, MessageStatus, SceneSnapshot, SendOverrides, Session, SessionStatus};

/// Collaborator REST surface the orchestrator depends on.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_run(&self, request: &CreateRunRequest) -> Result<RunHandle>;
    async fn fetch_run(&self, run_id: &str) -> Result<Value>;
    async fn fetch_capsule(&self, capsule_id: &str) -> Result<Value>;
    async fn fetch_session(&self, session_id: &str) -> Result<SessionRecord>;
    async fn approve_session(&self, session_id: &str, note: Option<&str>) -> Result<()>;
    async fn reject_session(&self, session_id: &str, note: Option<&str>) -> Result<()>;
}
