//! Single-writer session orchestrator
//!
//! Owns the session state and at most one live run. Every change to the
//! session goes through [`SessionOrchestrator::apply_event`] or one of the
//! explicit operations; transports only hand signals over a per-run channel.

use crate::SessionApi;
use crate::api::CreateRunRequest;
use crate::types::{
    AgentMessage, MessageStatus, SceneSnapshot, SendOverrides, Session, SessionStatus,
};
use capsule_core::{
    Applied, Error, IgnoreReason, Result, RunEvent, RunEventType, RunLifecycle, RunState,
    SessionConfig, ToolCallAssembler, WorkflowPlan, coerce_plan, parse_tool_calls,
};
use capsule_telemetry::{RunOutcome, record_run_outcome};
use capsule_transport::{Connector, RunController, StreamSignal, TransportKind, signal_channel};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const CLOSED_BEFORE_FINISH: &str = "Connection closed before the run finished";

/// What one pumped signal did to the session.
#[derive(Debug)]
pub enum SessionUpdate {
    Opened {
        run_id: String,
        transport: TransportKind,
    },
    Applied {
        run_id: String,
        event_type: RunEventType,
        state: RunState,
    },
    Ignored {
        run_id: String,
        event_type: RunEventType,
        reason: IgnoreReason,
    },
    StreamError {
        run_id: String,
        error: Error,
    },
    /// The stream ended. `state` is where the run's lifecycle stopped.
    Closed {
        run_id: String,
        state: Option<RunState>,
    },
}

struct RunSlot {
    lifecycle: RunLifecycle,
    assembler: ToolCallAssembler,
    /// Index of this run's assistant message in `Session::messages`.
    message_index: usize,
    events_applied: usize,
}

struct ActiveRun {
    run_id: String,
    controller: RunController,
    signals: mpsc::UnboundedReceiver<StreamSignal>,
}

pub struct SessionOrchestrator {
    api: Arc<dyn SessionApi>,
    connector: Arc<dyn Connector>,
    default_model: String,
    session: Session,
    runs: HashMap<String, RunSlot>,
    current_run: Option<String>,
    active: Option<ActiveRun>,
}

impl SessionOrchestrator {
    pub fn new(
        api: Arc<dyn SessionApi>,
        connector: Arc<dyn Connector>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            api,
            connector,
            default_model: config.agent_model.clone(),
            session: Session::new(config.agent_model.clone()),
            runs: HashMap::new(),
            current_run: None,
            active: None,
        }
    }

    /// Snapshot of the latest applied state.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run whose stream is currently open.
    pub fn active_run_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.run_id.as_str())
    }

    /// Most recently started run, open or not.
    pub fn current_run_id(&self) -> Option<&str> {
        self.current_run.as_deref()
    }

    pub fn run(&self, run_id: &str) -> Option<&RunLifecycle> {
        self.runs.get(run_id).map(|slot| &slot.lifecycle)
    }

    pub fn run_state(&self, run_id: &str) -> Option<RunState> {
        self.run(run_id).map(RunLifecycle::state)
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Post a user message and start streaming the run it creates.
    ///
    /// Any open run is closed first. Returns the new run id.
    pub async fn send_message(&mut self, content: &str, overrides: SendOverrides) -> Result<String> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::Session("Message is empty".to_string()));
        }

        self.close_active().await;
        self.session.messages.push(AgentMessage::user(content));

        let capsule_id = overrides
            .capsule_id
            .or_else(|| self.session.capsule_id.clone());
        let request = CreateRunRequest {
            message: content.to_string(),
            agent_model: overrides
                .agent_model
                .unwrap_or_else(|| self.session.agent_model.clone()),
            session_id: self.session.session_id.clone(),
            capsule_id: capsule_id.clone(),
            inputs: overrides.inputs,
        };

        let handle = match self.api.create_run(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Failed to create run: {}", e);
                self.session.status = SessionStatus::Failed;
                return Err(e);
            }
        };

        if handle.session_id.is_some() {
            self.session.session_id = handle.session_id;
        }
        if capsule_id.is_some() {
            self.session.capsule_id = capsule_id;
        }

        tracing::info!(run_id = %handle.run_id, model = %request.agent_model, "Run created");
        self.begin_run(&handle.run_id, None);
        self.attach(&handle.run_id).await?;
        Ok(handle.run_id)
    }

    /// Ask the server to cancel the open run. Returns false when nothing is
    /// streaming. The run only counts as finished once its terminal event or
    /// the stream close is pumped.
    pub async fn stop(&self) -> Result<bool> {
        let Some(active) = &self.active else {
            tracing::debug!("Stop requested with no active run");
            return Ok(false);
        };

        tracing::info!(
            run_id = %active.run_id,
            transport = %active.controller.transport(),
            "Requesting run cancellation"
        );
        active.controller.cancel().await?;
        Ok(true)
    }

    /// Replace the current session with a stored one, discarding any live
    /// connection. Reattaches to the session's run when it is still going.
    pub async fn load_session(&mut self, session_id: &str) -> Result<()> {
        self.close_active().await;
        let record = self.api.fetch_session(session_id).await?;

        let mut session = Session::new(
            record
                .agent_model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
        );
        session.session_id = Some(record.session_id.clone());
        session.capsule_id = record.capsule_id.clone();
        session.status = record
            .status
            .as_deref()
            .and_then(SessionStatus::from_wire)
            .unwrap_or_default();
        session.messages = record
            .messages
            .iter()
            .filter_map(AgentMessage::from_value)
            .collect();
        for scene in record.scenes.iter().filter_map(SceneSnapshot::from_value) {
            session.push_scene(scene);
        }
        session.latest_plan = session.messages.iter().rev().find_map(|message| match message {
            AgentMessage::Tool { output, .. } => plan_from_output(output),
            _ => None,
        });

        tracing::info!(
            session_id = %record.session_id,
            messages = session.messages.len(),
            scenes = session.scenes.len(),
            "Session loaded"
        );
        self.runs.clear();
        self.current_run = None;
        self.session = session;

        if self.session.status == SessionStatus::Running
            && let Some(run_id) = record.active_run_id
        {
            self.resume_run(&run_id).await?;
        }
        Ok(())
    }

    /// Drop all session state and any live connection.
    pub async fn reset_session(&mut self) {
        self.close_active().await;
        self.runs.clear();
        self.current_run = None;
        self.session = Session::new(self.default_model.clone());
        tracing::info!("Session reset");
    }

    pub async fn approve_session(&mut self, session_id: &str, note: Option<&str>) -> Result<()> {
        self.api.approve_session(session_id, note).await?;
        self.set_decision(session_id, SessionStatus::Approved);
        Ok(())
    }

    pub async fn reject_session(&mut self, session_id: &str, note: Option<&str>) -> Result<()> {
        self.api.reject_session(session_id, note).await?;
        self.set_decision(session_id, SessionStatus::Rejected);
        Ok(())
    }

    /// Fetch a capsule definition and make it the session's capsule. A plan
    /// found in it becomes the latest plan.
    pub async fn attach_capsule(&mut self, capsule_id: &str) -> Result<Value> {
        let capsule = self.api.fetch_capsule(capsule_id).await?;
        self.session.capsule_id = Some(capsule_id.to_string());
        if let Some(plan) = plan_from_output(&capsule) {
            self.session.latest_plan = Some(plan);
        }
        Ok(capsule)
    }

    /// Wait for the next signal of the open run and apply it.
    ///
    /// Returns `None` when no run is open. After a terminal event the stream
    /// is closed and the following call returns `None`.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        let active = self.active.as_mut()?;
        let run_id = active.run_id.clone();
        let signal = active.signals.recv().await;

        let update = match signal {
            Some(StreamSignal::Opened(transport)) => {
                tracing::debug!(%run_id, %transport, "Run stream open");
                SessionUpdate::Opened { run_id, transport }
            }
            Some(StreamSignal::Event(event)) => {
                let update = self.apply_event(event);
                if self.run_state(&run_id).is_some_and(RunState::is_terminal) {
                    self.close_active().await;
                }
                update
            }
            Some(StreamSignal::Error(error)) => SessionUpdate::StreamError { run_id, error },
            Some(StreamSignal::Closed) | None => {
                self.active = None;
                self.handle_stream_closed(&run_id);
                SessionUpdate::Closed {
                    state: self.run_state(&run_id),
                    run_id,
                }
            }
        };
        Some(update)
    }

    /// Pump the open run until its stream ends and return its final state.
    pub async fn drive(&mut self) -> Option<RunState> {
        let run_id = self.active.as_ref()?.run_id.clone();
        while self.next_update().await.is_some() {}
        self.run_state(&run_id)
    }

    /// Apply one decoded event to the current run and project it onto the
    /// session. This is the only path by which stream data changes state.
    pub fn apply_event(&mut self, mut event: RunEvent) -> SessionUpdate {
        let event_type = event.event_type;
        let Some(run_id) = self.current_run.clone() else {
            return SessionUpdate::Ignored {
                run_id: event.owner_id().to_string(),
                event_type,
                reason: IgnoreReason::ForeignRun,
            };
        };

        // Session-scoped envelopes belong to whatever run the session is on.
        if event.run_id.is_none()
            && event.session_id.is_some()
            && event.session_id == self.session.session_id
        {
            event.run_id = Some(run_id.clone());
        }

        let Some(slot) = self.runs.get_mut(&run_id) else {
            return SessionUpdate::Ignored {
                run_id,
                event_type,
                reason: IgnoreReason::ForeignRun,
            };
        };

        if let Applied::Ignored(reason) = slot.lifecycle.apply(&event) {
            tracing::debug!(%run_id, %event_type, ?reason, "Event ignored");
            return SessionUpdate::Ignored {
                run_id,
                event_type,
                reason,
            };
        }
        slot.events_applied += 1;
        let state = slot.lifecycle.state();

        self.project(&run_id, &event);
        if state.is_terminal() {
            self.record_outcome(&run_id, None);
        }

        SessionUpdate::Applied {
            run_id,
            event_type,
            state,
        }
    }

    fn project(&mut self, run_id: &str, event: &RunEvent) {
        let payload = &event.payload;
        match event.event_type {
            RunEventType::Queued | RunEventType::Started => {
                self.session.status = SessionStatus::Running;
            }
            RunEventType::Progress => {
                if let Some(progress) = self.run(run_id).and_then(RunLifecycle::progress) {
                    self.session.progress = Some(progress);
                }
            }
            RunEventType::Partial => self.project_partial(run_id, payload),
            RunEventType::Completed => {
                if let Some(output) = payload.get("output") {
                    self.absorb_plan(output);
                }
                if let Some(content) = payload.get("content").and_then(Value::as_str) {
                    self.update_content(run_id, |current| *current = content.to_string());
                }
                if let Some(calls) = payload.get("tool_calls") {
                    self.absorb_tool_calls(run_id, calls);
                }
                self.session.progress = Some(1.0);
                self.finish_assistant(run_id, MessageStatus::Complete, None);
                self.session.status = SessionStatus::Completed;
            }
            RunEventType::Failed => {
                let message = self
                    .run(run_id)
                    .and_then(RunLifecycle::failure)
                    .unwrap_or("Run failed")
                    .to_string();
                self.finish_assistant(run_id, MessageStatus::Error, Some(message));
                self.session.status = SessionStatus::Failed;
            }
            RunEventType::Cancelled => {
                self.finish_assistant(run_id, MessageStatus::Cancelled, None);
                self.session.status = SessionStatus::Cancelled;
            }
        }
    }

    fn project_partial(&mut self, run_id: &str, payload: &Map<String, Value>) {
        if let Some(delta) = payload.get("delta").and_then(Value::as_str) {
            self.update_content(run_id, |current| current.push_str(delta));
        }
        if let Some(content) = payload.get("content").and_then(Value::as_str) {
            self.update_content(run_id, |current| *current = content.to_string());
        }
        if let Some(calls) = payload.get("tool_calls") {
            self.absorb_tool_calls(run_id, calls);
        }
        match payload.get("tool_result") {
            Some(Value::Array(results)) => results.iter().for_each(|r| self.absorb_tool_result(r)),
            Some(result) => self.absorb_tool_result(result),
            None => {}
        }
        if let Some(scene) = payload.get("scene") {
            self.absorb_scene(scene);
        }
        if let Some(Value::Array(scenes)) = payload.get("scenes") {
            scenes.iter().for_each(|scene| self.absorb_scene(scene));
        }
        if let Some(progress) = payload.get("progress").and_then(Value::as_f64) {
            self.session.progress = Some(progress);
        }
    }

    fn absorb_tool_calls(&mut self, run_id: &str, raw: &Value) {
        let incoming = parse_tool_calls(raw);
        let Some(slot) = self.runs.get_mut(run_id) else {
            return;
        };
        if !slot.assembler.absorb(&incoming) {
            return;
        }
        let calls = slot.assembler.calls().to_vec();
        if let Some(AgentMessage::Assistant { tool_calls, .. }) = self.assistant_mut(run_id) {
            *tool_calls = calls;
        }
    }

    fn absorb_tool_result(&mut self, raw: &Value) {
        let Some(message) = AgentMessage::tool_result(raw) else {
            tracing::warn!("Dropping tool result that is not an object");
            return;
        };
        if let AgentMessage::Tool { output, .. } = &message {
            self.absorb_plan(output);
        }
        self.session.messages.push(message);
    }

    fn absorb_scene(&mut self, raw: &Value) {
        if let Some(scene) = SceneSnapshot::from_value(raw) {
            self.session.push_scene(scene);
        }
    }

    fn absorb_plan(&mut self, output: &Value) {
        if let Some(plan) = plan_from_output(output) {
            tracing::info!(
                workflow_id = %plan.workflow_id,
                nodes = plan.nodes.len(),
                edges = plan.edges.len(),
                "Workflow plan received"
            );
            self.session.latest_plan = Some(plan);
        }
    }

    fn assistant_mut(&mut self, run_id: &str) -> Option<&mut AgentMessage> {
        let index = self.runs.get(run_id)?.message_index;
        self.session.messages.get_mut(index)
    }

    fn update_content(&mut self, run_id: &str, edit: impl FnOnce(&mut String)) {
        if let Some(AgentMessage::Assistant { content, .. }) = self.assistant_mut(run_id) {
            edit(content);
        }
    }

    fn finish_assistant(&mut self, run_id: &str, status: MessageStatus, error: Option<String>) {
        if let Some(AgentMessage::Assistant {
            status: current,
            error: current_error,
            ..
        }) = self.assistant_mut(run_id)
        {
            *current = status;
            if error.is_some() {
                *current_error = error;
            }
        }
    }

    fn set_decision(&mut self, session_id: &str, status: SessionStatus) {
        if self.session.session_id.as_deref() == Some(session_id) {
            self.session.status = status;
        }
    }

    fn begin_run(&mut self, run_id: &str, existing_message: Option<usize>) {
        let mut assembler = ToolCallAssembler::new();
        let message_index = match existing_message {
            Some(index) => {
                if let Some(AgentMessage::Assistant { tool_calls, .. }) =
                    self.session.messages.get(index)
                {
                    assembler.absorb(tool_calls);
                }
                index
            }
            None => {
                self.session.messages.push(AgentMessage::streaming(run_id));
                self.session.messages.len() - 1
            }
        };

        self.runs.insert(
            run_id.to_string(),
            RunSlot {
                lifecycle: RunLifecycle::new(run_id),
                assembler,
                message_index,
                events_applied: 0,
            },
        );
        self.current_run = Some(run_id.to_string());
        self.session.status = SessionStatus::Running;
        self.session.progress = None;
    }

    async fn attach(&mut self, run_id: &str) -> Result<()> {
        let (handler, signals) = signal_channel();
        match self.connector.open(run_id, handler).await {
            Ok(controller) => {
                self.active = Some(ActiveRun {
                    run_id: run_id.to_string(),
                    controller,
                    signals,
                });
                Ok(())
            }
            Err(e) => {
                self.fail_run(run_id, &e.to_string());
                Err(e)
            }
        }
    }

    async fn resume_run(&mut self, run_id: &str) -> Result<()> {
        match self.api.fetch_run(run_id).await {
            Ok(run) => {
                let status = run.get("status").and_then(Value::as_str).unwrap_or_default();
                let finished = RunEventType::from_wire(status).is_some_and(RunEventType::is_terminal);
                if finished {
                    tracing::info!(%run_id, status, "Stored run already finished, not attaching");
                    if let Some(status) = SessionStatus::from_wire(status) {
                        self.session.status = status;
                    }
                    return Ok(());
                }
            }
            Err(e) => tracing::warn!(%run_id, "Could not fetch run, attaching anyway: {}", e),
        }

        let existing = match self.session.messages.last() {
            Some(AgentMessage::Assistant {
                status: MessageStatus::Streaming,
                ..
            }) => Some(self.session.messages.len() - 1),
            _ => None,
        };
        self.begin_run(run_id, existing);
        self.attach(run_id).await
    }

    /// Close the open run, if any. A run discarded before its terminal event
    /// leaves its assistant message cancelled.
    async fn close_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.controller.close().await;

        let unfinished = self
            .run(&active.run_id)
            .is_some_and(|lifecycle| !lifecycle.is_terminal());
        if unfinished {
            tracing::info!(run_id = %active.run_id, "Discarding unfinished run");
            self.finish_assistant(&active.run_id, MessageStatus::Cancelled, None);
        }
    }

    fn handle_stream_closed(&mut self, run_id: &str) {
        let finished = self
            .run(run_id)
            .is_none_or(|lifecycle| lifecycle.is_terminal());
        if finished {
            return;
        }
        tracing::warn!(%run_id, "Stream closed before a terminal event");
        self.fail_run(run_id, CLOSED_BEFORE_FINISH);
    }

    fn fail_run(&mut self, run_id: &str, message: &str) {
        self.finish_assistant(run_id, MessageStatus::Error, Some(message.to_string()));
        self.session.status = SessionStatus::Failed;
        self.record_outcome(run_id, Some(message.to_string()));
    }

    fn record_outcome(&self, run_id: &str, message: Option<String>) {
        let Some(slot) = self.runs.get(run_id) else {
            return;
        };
        record_run_outcome(&RunOutcome {
            run_id: run_id.to_string(),
            session_id: self.session.session_id.clone(),
            state: slot.lifecycle.state().as_str().to_string(),
            events_applied: slot.events_applied,
            seq_anomalies: slot.lifecycle.seq_anomalies(),
            message: message.or_else(|| slot.lifecycle.failure().map(str::to_string)),
        });
    }
}

/// Coerce a tool output into a plan. String outputs holding JSON are parsed
/// first.
fn plan_from_output(output: &Value) -> Option<WorkflowPlan> {
    match output {
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|value| coerce_plan(&value)),
        other => coerce_plan(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{RunHandle, SessionRecord};
    use async_trait::async_trait;
    use capsule_transport::{RunConnection, RunHandler};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn plan_output() -> Value {
        json!({
            "plan": {
                "workflow_id": "wf-1",
                "nodes": [{"id": "n1", "type": "scene", "position": {"x": 0, "y": 0}}],
                "edges": []
            }
        })
    }

    #[derive(Default)]
    struct FakeApi {
        requests: Mutex<Vec<CreateRunRequest>>,
        record: Mutex<Option<SessionRecord>>,
        run_status: Mutex<Option<Value>>,
        decisions: Mutex<Vec<(String, String, Option<String>)>>,
        fail_create: AtomicBool,
    }

    #[async_trait]
    impl SessionApi for FakeApi {
        async fn create_run(&self, request: &CreateRunRequest) -> Result<RunHandle> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(Error::Http {
                    status: 503,
                    detail: "Run queue is full".to_string(),
                });
            }
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            Ok(RunHandle {
                run_id: format!("r{}", requests.len()),
                session_id: Some("s1".to_string()),
                status: Some("queued".to_string()),
            })
        }

        async fn fetch_run(&self, _run_id: &str) -> Result<Value> {
            Ok(self
                .run_status
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| json!({"status": "running"})))
        }

        async fn fetch_capsule(&self, capsule_id: &str) -> Result<Value> {
            let mut capsule = plan_output();
            capsule["capsule_id"] = json!(capsule_id);
            Ok(capsule)
        }

        async fn fetch_session(&self, _session_id: &str) -> Result<SessionRecord> {
            self.record.lock().unwrap().clone().ok_or(Error::Http {
                status: 404,
                detail: "Session not found".to_string(),
            })
        }

        async fn approve_session(&self, session_id: &str, note: Option<&str>) -> Result<()> {
            self.decisions.lock().unwrap().push((
                session_id.to_string(),
                "approve".to_string(),
                note.map(str::to_string),
            ));
            Ok(())
        }

        async fn reject_session(&self, session_id: &str, note: Option<&str>) -> Result<()> {
            self.decisions.lock().unwrap().push((
                session_id.to_string(),
                "reject".to_string(),
                note.map(str::to_string),
            ));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        handlers: Mutex<HashMap<String, Arc<dyn RunHandler>>>,
        cancels: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl FakeConnector {
        fn handler(&self, run_id: &str) -> Arc<dyn RunHandler> {
            self.handlers.lock().unwrap()[run_id].clone()
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn open(&self, run_id: &str, handler: Arc<dyn RunHandler>) -> Result<RunController> {
            self.handlers
                .lock()
                .unwrap()
                .insert(run_id.to_string(), handler.clone());
            Ok(RunController::new(Box::new(FakeConnection {
                run_id: run_id.to_string(),
                handler,
                cancels: self.cancels.clone(),
                closes: self.closes.clone(),
                closed: AtomicBool::new(false),
            })))
        }
    }

    struct FakeConnection {
        run_id: String,
        handler: Arc<dyn RunHandler>,
        cancels: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl RunConnection for FakeConnection {
        fn transport(&self) -> TransportKind {
            TransportKind::Sse
        }

        fn run_id(&self) -> &str {
            &self.run_id
        }

        async fn cancel(&self) -> Result<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.closes.fetch_add(1, Ordering::SeqCst);
                self.handler.on_close();
            }
        }
    }

    fn setup() -> (SessionOrchestrator, Arc<FakeApi>, Arc<FakeConnector>) {
        let api = Arc::new(FakeApi::default());
        let connector = Arc::new(FakeConnector::default());
        let orchestrator =
            SessionOrchestrator::new(api.clone(), connector.clone(), &SessionConfig::default());
        (orchestrator, api, connector)
    }

    fn event(run_id: &str, ty: RunEventType, payload: Value) -> RunEvent {
        RunEvent::new(run_id, ty).with_payload(payload)
    }

    fn assistant(session: &Session, index: usize) -> (&str, usize, MessageStatus, Option<&str>) {
        match &session.messages[index] {
            AgentMessage::Assistant {
                content,
                tool_calls,
                status,
                error,
                ..
            } => (content.as_str(), tool_calls.len(), *status, error.as_deref()),
            other => panic!("expected assistant message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_run_projects_onto_session() {
        let (mut orchestrator, api, connector) = setup();
        let run_id = orchestrator
            .send_message("  Make a teaser  ", SendOverrides::default())
            .await
            .unwrap();
        assert_eq!(run_id, "r1");
        assert_eq!(orchestrator.session().session_id.as_deref(), Some("s1"));
        assert_eq!(orchestrator.session().status, SessionStatus::Running);
        assert_eq!(api.requests.lock().unwrap()[0].message, "Make a teaser");
        assert_eq!(
            api.requests.lock().unwrap()[0].agent_model,
            "capsule-director-v1"
        );

        let handler = connector.handler("r1");
        handler.on_open(TransportKind::Sse);
        handler.on_event(event("r1", RunEventType::Started, json!({})));
        handler.on_event(event("r1", RunEventType::Partial, json!({"delta": "Draft"})));
        handler.on_event(event("r1", RunEventType::Partial, json!({"delta": "ing"})));
        handler.on_event(event(
            "r1",
            RunEventType::Partial,
            json!({"tool_calls": [{"id": "t1", "name": "plan"}]}),
        ));
        handler.on_event(event(
            "r1",
            RunEventType::Partial,
            json!({"tool_calls": [{"id": "t1", "name": "plan"}, {"id": "t2", "name": "render"}]}),
        ));
        handler.on_event(event(
            "r1",
            RunEventType::Partial,
            json!({"tool_result": {"name": "plan", "output": plan_output()}}),
        ));
        handler.on_event(event(
            "r1",
            RunEventType::Partial,
            json!({"scene": {"scene_id": "s-1", "title": "Open"}}),
        ));
        handler.on_event(event(
            "r1",
            RunEventType::Partial,
            json!({"scenes": [{"scene_id": "s-1"}, {"scene_id": "s-2"}], "progress": 0.5}),
        ));
        handler.on_event(event(
            "r1",
            RunEventType::Progress,
            json!({"progress": 0.8}),
        ));
        handler.on_event(event("r1", RunEventType::Completed, json!({"content": "Done"})));

        assert!(matches!(
            orchestrator.next_update().await,
            Some(SessionUpdate::Opened { .. })
        ));
        assert_eq!(orchestrator.drive().await, Some(RunState::Completed));
        assert!(!orchestrator.is_running());
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);

        let session = orchestrator.session();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.messages.len(), 3);
        assert_eq!(assistant(session, 1), ("Done", 2, MessageStatus::Complete, None));
        assert!(matches!(
            &session.messages[2],
            AgentMessage::Tool { name, status: MessageStatus::Complete, .. } if name == "plan"
        ));
        assert_eq!(session.latest_plan.as_ref().unwrap().workflow_id, "wf-1");
        let scene_ids: Vec<_> = session.scenes.iter().map(|s| s.scene_id.as_str()).collect();
        assert_eq!(scene_ids, vec!["s-1", "s-2"]);
        assert_eq!(session.progress, Some(1.0));
        assert_eq!(orchestrator.next_update().await.map(|_| ()), None);
    }

    #[tokio::test]
    async fn test_close_before_terminal_fails_run() {
        let (mut orchestrator, _api, connector) = setup();
        orchestrator
            .send_message("hello", SendOverrides::default())
            .await
            .unwrap();

        let handler = connector.handler("r1");
        handler.on_event(event("r1", RunEventType::Started, json!({})));
        handler.on_event(event("r1", RunEventType::Partial, json!({"delta": "Half"})));
        handler.on_close();

        assert_eq!(orchestrator.drive().await, Some(RunState::Partial));
        let session = orchestrator.session();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(
            assistant(session, 1),
            ("Half", 0, MessageStatus::Error, Some(CLOSED_BEFORE_FINISH))
        );
    }

    #[tokio::test]
    async fn test_failed_run_keeps_message() {
        let (mut orchestrator, _api, connector) = setup();
        orchestrator
            .send_message("hello", SendOverrides::default())
            .await
            .unwrap();

        connector.handler("r1").on_event(event(
            "r1",
            RunEventType::Failed,
            json!({"error": "GPU quota exceeded"}),
        ));

        assert_eq!(orchestrator.drive().await, Some(RunState::Failed));
        assert_eq!(orchestrator.session().status, SessionStatus::Failed);
        assert_eq!(
            assistant(orchestrator.session(), 1),
            ("", 0, MessageStatus::Error, Some("GPU quota exceeded"))
        );
    }

    #[tokio::test]
    async fn test_stop_cancels_and_waits_for_terminal() {
        let (mut orchestrator, _api, connector) = setup();
        assert!(!orchestrator.stop().await.unwrap());

        orchestrator
            .send_message("hello", SendOverrides::default())
            .await
            .unwrap();
        assert!(orchestrator.stop().await.unwrap());
        assert_eq!(connector.cancels.load(Ordering::SeqCst), 1);
        // Still streaming until the server confirms.
        assert!(orchestrator.is_running());

        connector
            .handler("r1")
            .on_event(event("r1", RunEventType::Cancelled, json!({})));
        assert_eq!(orchestrator.drive().await, Some(RunState::Cancelled));
        assert_eq!(orchestrator.session().status, SessionStatus::Cancelled);
        assert_eq!(
            assistant(orchestrator.session(), 1).2,
            MessageStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_apply_event_routes_and_ignores() {
        let (mut orchestrator, _api, _connector) = setup();
        assert!(matches!(
            orchestrator.apply_event(event("r1", RunEventType::Started, json!({}))),
            SessionUpdate::Ignored {
                reason: IgnoreReason::ForeignRun,
                ..
            }
        ));

        orchestrator
            .send_message("hello", SendOverrides::default())
            .await
            .unwrap();

        assert!(matches!(
            orchestrator.apply_event(event("other", RunEventType::Started, json!({}))),
            SessionUpdate::Ignored {
                reason: IgnoreReason::ForeignRun,
                ..
            }
        ));

        let mut scoped = RunEvent::new("x", RunEventType::Started).with_event_id("e1");
        scoped.run_id = None;
        scoped.session_id = Some("s1".to_string());
        assert!(matches!(
            orchestrator.apply_event(scoped.clone()),
            SessionUpdate::Applied {
                state: RunState::Started,
                ..
            }
        ));
        assert!(matches!(
            orchestrator.apply_event(scoped),
            SessionUpdate::Ignored {
                reason: IgnoreReason::Duplicate,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_new_message_discards_previous_run() {
        let (mut orchestrator, api, connector) = setup();
        orchestrator
            .send_message("first", SendOverrides::default())
            .await
            .unwrap();
        let second = orchestrator
            .send_message(
                "second",
                SendOverrides {
                    agent_model: Some("capsule-fast".to_string()),
                    capsule_id: Some("cap-9".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(second, "r2");
        assert_eq!(orchestrator.active_run_id(), Some("r2"));
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
        assert_eq!(assistant(orchestrator.session(), 1).2, MessageStatus::Cancelled);
        assert_eq!(assistant(orchestrator.session(), 3).2, MessageStatus::Streaming);
        assert_eq!(orchestrator.session().capsule_id.as_deref(), Some("cap-9"));

        let requests = api.requests.lock().unwrap();
        assert_eq!(requests[1].agent_model, "capsule-fast");
        assert_eq!(requests[1].session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_send_message_errors() {
        let (mut orchestrator, api, _connector) = setup();
        assert!(matches!(
            orchestrator.send_message("   ", SendOverrides::default()).await,
            Err(Error::Session(_))
        ));
        assert!(orchestrator.session().messages.is_empty());

        api.fail_create.store(true, Ordering::SeqCst);
        let err = orchestrator
            .send_message("hello", SendOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { status: 503, .. }));
        assert_eq!(orchestrator.session().status, SessionStatus::Failed);
        assert_eq!(orchestrator.session().messages, vec![AgentMessage::user("hello")]);
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_load_session_replaces_state() {
        let (mut orchestrator, api, connector) = setup();
        orchestrator
            .send_message("throwaway", SendOverrides::default())
            .await
            .unwrap();

        *api.record.lock().unwrap() = Some(SessionRecord {
            session_id: "s7".to_string(),
            status: Some("completed".to_string()),
            agent_model: Some("capsule-pro".to_string()),
            capsule_id: None,
            messages: vec![
                json!({"role": "user", "content": "Plan it"}),
                json!({"role": "assistant", "content": "Planning", "tool_calls": [{"id": "t1", "name": "plan"}]}),
                json!({"role": "tool", "name": "plan", "output": plan_output()}),
                json!({"role": "narrator", "content": "?"}),
            ],
            scenes: vec![json!({"id": "a"}), json!({"id": "a"}), json!({"id": "b"})],
            active_run_id: None,
        });

        orchestrator.load_session("s7").await.unwrap();
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
        assert!(!orchestrator.is_running());
        assert_eq!(orchestrator.current_run_id(), None);

        let session = orchestrator.session();
        assert_eq!(session.session_id.as_deref(), Some("s7"));
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.agent_model, "capsule-pro");
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.scenes.len(), 2);
        assert_eq!(session.latest_plan.as_ref().unwrap().workflow_id, "wf-1");
    }

    #[tokio::test]
    async fn test_load_session_resumes_live_run() {
        let (mut orchestrator, api, connector) = setup();
        *api.record.lock().unwrap() = Some(SessionRecord {
            session_id: "s7".to_string(),
            status: Some("running".to_string()),
            agent_model: None,
            capsule_id: None,
            messages: vec![
                json!({"role": "user", "content": "Go"}),
                json!({"role": "assistant", "content": "Work", "status": "streaming",
                       "tool_calls": [{"id": "t1", "name": "plan"}]}),
            ],
            scenes: vec![],
            active_run_id: Some("r7".to_string()),
        });

        orchestrator.load_session("s7").await.unwrap();
        assert_eq!(orchestrator.active_run_id(), Some("r7"));
        assert_eq!(orchestrator.session().messages.len(), 2);

        let handler = connector.handler("r7");
        handler.on_event(event(
            "r7",
            RunEventType::Partial,
            json!({"delta": "ing", "tool_calls": [{"id": "t2", "name": "render"}]}),
        ));
        handler.on_event(event("r7", RunEventType::Completed, json!({})));
        assert_eq!(orchestrator.drive().await, Some(RunState::Completed));
        assert_eq!(
            assistant(orchestrator.session(), 1),
            ("Working", 2, MessageStatus::Complete, None)
        );
    }

    #[tokio::test]
    async fn test_load_session_skips_finished_run() {
        let (mut orchestrator, api, _connector) = setup();
        *api.run_status.lock().unwrap() = Some(json!({"status": "completed"}));
        *api.record.lock().unwrap() = Some(SessionRecord {
            session_id: "s7".to_string(),
            status: Some("running".to_string()),
            agent_model: None,
            capsule_id: None,
            messages: vec![],
            scenes: vec![],
            active_run_id: Some("r7".to_string()),
        });

        orchestrator.load_session("s7").await.unwrap();
        assert!(!orchestrator.is_running());
        assert_eq!(orchestrator.session().status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_load_missing_session_is_error() {
        let (mut orchestrator, _api, _connector) = setup();
        assert!(matches!(
            orchestrator.load_session("nope").await,
            Err(Error::Http { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_decisions_and_reset() {
        let (mut orchestrator, api, connector) = setup();
        orchestrator
            .send_message("hello", SendOverrides::default())
            .await
            .unwrap();

        orchestrator
            .reject_session("someone-else", None)
            .await
            .unwrap();
        assert_eq!(orchestrator.session().status, SessionStatus::Running);

        orchestrator
            .approve_session("s1", Some("ship it"))
            .await
            .unwrap();
        assert_eq!(orchestrator.session().status, SessionStatus::Approved);
        assert_eq!(
            api.decisions.lock().unwrap().clone(),
            vec![
                ("someone-else".to_string(), "reject".to_string(), None),
                ("s1".to_string(), "approve".to_string(), Some("ship it".to_string())),
            ]
        );

        orchestrator.reset_session().await;
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.session(), &Session::new("capsule-director-v1"));
        assert!(orchestrator.next_update().await.is_none());
    }

    #[tokio::test]
    async fn test_attach_capsule_sets_plan() {
        let (mut orchestrator, _api, _connector) = setup();
        let capsule = orchestrator.attach_capsule("cap-3").await.unwrap();
        assert_eq!(capsule["capsule_id"], "cap-3");
        assert_eq!(orchestrator.session().capsule_id.as_deref(), Some("cap-3"));
        assert!(orchestrator.session().latest_plan.is_some());
    }

    #[test]
    fn test_plan_from_string_output() {
        let raw = Value::String(plan_output().to_string());
        assert!(plan_from_output(&raw).is_some());
        assert!(plan_from_output(&json!("not json")).is_none());
    }
}
