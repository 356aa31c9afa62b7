//! In-process backend for integration tests
//!
//! Serves the run stream over WebSocket and SSE plus the JSON endpoints the
//! session layer calls. Run ids starting with `hold` stream `run.started` and
//! then wait for a cancel before finishing.

#![allow(dead_code)]

use async_stream::stream;
use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, Sse},
    },
    routing::{get, post},
};
use capsule_transport::StreamSignal;
use futures::stream::{self, Stream, StreamExt};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

pub const CANCEL_FRAME: &str = r#"{"type":"cancel"}"#;

#[derive(Default)]
pub struct Backend {
    /// Run ids cancelled through the HTTP side channel.
    pub cancels: Mutex<Vec<String>>,
    /// Text frames the client sent over WebSocket.
    pub ws_frames: Mutex<Vec<String>>,
    /// `Authorization` header of each WebSocket upgrade request.
    pub ws_auth: Mutex<Vec<Option<String>>>,
    /// Bodies of run creation requests.
    pub created: Mutex<Vec<Value>>,
    /// `(session_id, action, body)` of approve/reject calls.
    pub decisions: Mutex<Vec<(String, String, Value)>>,
    cancel_signal: Notify,
}

/// Start the backend on an ephemeral port and return its base URL.
pub async fn spawn_backend() -> (String, Arc<Backend>) {
    let state = Arc::new(Backend::default());
    let app = Router::new()
        .route("/ws/runs/:run_id", get(ws_run))
        .route("/api/v1/capsules/run", post(create_run))
        .route("/api/v1/capsules/run/:run_id", get(fetch_run))
        .route("/api/v1/capsules/run/:run_id/stream", get(sse_run))
        .route("/api/v1/capsules/run/:run_id/cancel", post(cancel_run))
        .route("/api/v1/capsules/:capsule_id", get(fetch_capsule))
        .route("/api/v1/agent/sessions/:session_id", get(fetch_session))
        .route(
            "/api/v1/agent/sessions/:session_id/:action",
            post(decide_session),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });

    (format!("http://{}", addr), state)
}

pub fn envelope(run_id: &str, ty: &str, seq: u64, payload: Value) -> Value {
    json!({
        "event_id": format!("{}-{}", run_id, seq),
        "run_id": run_id,
        "type": ty,
        "seq": seq,
        "ts": "2024-05-01T10:00:00Z",
        "payload": payload,
    })
}

pub fn plan_output() -> Value {
    json!({
        "workflow_id": "wf-test",
        "nodes": [
            {"id": "n1", "type": "scene", "position": {"x": 0, "y": 0}},
            {"id": "n2", "type": "voiceover", "position": {"x": 240, "y": 0}}
        ],
        "edges": [{"id": "e1", "source": "n1", "target": "n2"}],
        "estimated_duration_sec": 30
    })
}

/// The scripted run every non-holding stream plays.
pub fn script(run_id: &str) -> Vec<Value> {
    let call = json!({"id": "call-1", "name": "plan_workflow", "arguments": "{\"scenes\":2}"});
    vec![
        envelope(run_id, "run.queued", 1, json!({})),
        envelope(run_id, "run.started", 2, json!({})),
        envelope(run_id, "run.progress", 3, json!({"progress": 0.3})),
        envelope(
            run_id,
            "run.partial",
            4,
            json!({"delta": "Storyboarding", "tool_calls": [call.clone()]}),
        ),
        envelope(
            run_id,
            "run.partial",
            5,
            json!({
                "tool_calls": [call],
                "tool_result": {"name": "plan_workflow", "output": plan_output()}
            }),
        ),
        envelope(
            run_id,
            "run.partial",
            6,
            json!({"scene": {"scene_id": "scene-1", "title": "Opening", "media_url": "https://cdn.test/1.mp4"}}),
        ),
        envelope(
            run_id,
            "run.completed",
            7,
            json!({"content": "Your teaser is ready"}),
        ),
    ]
}

/// Receive signals until `Closed`, failing the test after five quiet seconds.
pub async fn collect_until_closed(
    rx: &mut mpsc::UnboundedReceiver<StreamSignal>,
) -> Vec<StreamSignal> {
    let mut signals = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(StreamSignal::Closed)) => {
                signals.push(StreamSignal::Closed);
                return signals;
            }
            Ok(Some(signal)) => signals.push(signal),
            Ok(None) => return signals,
            Err(_) => panic!("timed out waiting for stream signals: {:?}", signals),
        }
    }
}

/// Receive the next signal, failing the test after five seconds.
pub async fn next_signal(rx: &mut mpsc::UnboundedReceiver<StreamSignal>) -> StreamSignal {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a stream signal")
        .expect("stream channel closed")
}

async fn ws_run(
    ws: WebSocketUpgrade,
    Path(run_id): Path<String>,
    State(state): State<Arc<Backend>>,
    headers: HeaderMap,
) -> Response {
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    state.ws_auth.lock().unwrap().push(auth);
    ws.on_upgrade(move |socket| stream_ws(socket, run_id, state))
}

async fn stream_ws(mut socket: WebSocket, run_id: String, state: Arc<Backend>) {
    if run_id.starts_with("hold") {
        let started = envelope(&run_id, "run.started", 1, json!({}));
        let _ = socket.send(Message::Text(started.to_string())).await;

        while let Some(Ok(message)) = socket.recv().await {
            let Message::Text(text) = message else {
                continue;
            };
            state.ws_frames.lock().unwrap().push(text.clone());
            if text == CANCEL_FRAME {
                let cancelled = envelope(&run_id, "run.cancelled", 2, json!({}));
                let _ = socket.send(Message::Text(cancelled.to_string())).await;
                break;
            }
        }
    } else {
        let frames = script(&run_id);
        for (i, frame) in frames.iter().enumerate() {
            if i == 2 {
                let _ = socket.send(Message::Text("not json".to_string())).await;
            }
            let _ = socket.send(Message::Text(frame.to_string())).await;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

fn sse_event(frame: &Value) -> Result<SseEvent, Infallible> {
    let name = frame["type"].as_str().unwrap_or_default();
    Ok(SseEvent::default().event(name).data(frame.to_string()))
}

async fn sse_run(Path(run_id): Path<String>, State(state): State<Arc<Backend>>) -> Response {
    if run_id == "missing" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Run not found"})),
        )
            .into_response();
    }

    if run_id.starts_with("hold") {
        return Sse::new(held_stream(run_id, state)).into_response();
    }

    let mut events = Vec::new();
    for (i, frame) in script(&run_id).iter().enumerate() {
        if i == 2 {
            events.push(Ok(SseEvent::default().event("ping").data("{}")));
            events.push(Ok(SseEvent::default().event("run.partial").data("{oops")));
        }
        events.push(sse_event(frame));
    }
    Sse::new(stream::iter(events)).into_response()
}

fn held_stream(
    run_id: String,
    state: Arc<Backend>,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    stream! {
        yield sse_event(&envelope(&run_id, "run.started", 1, json!({})));
        state.cancel_signal.notified().await;
        yield sse_event(&envelope(&run_id, "run.cancelled", 2, json!({})));
    }
    .boxed()
}

async fn cancel_run(Path(run_id): Path<String>, State(state): State<Arc<Backend>>) -> Json<Value> {
    state.cancels.lock().unwrap().push(run_id.clone());
    state.cancel_signal.notify_one();
    Json(json!({"run_id": run_id, "status": "cancelling"}))
}

async fn create_run(State(state): State<Arc<Backend>>, Json(body): Json<Value>) -> Json<Value> {
    let mut created = state.created.lock().unwrap();
    created.push(body.clone());
    let n = created.len();
    let holding = body["message"]
        .as_str()
        .is_some_and(|m| m.contains("[hold]"));
    let run_id = if holding {
        format!("hold-{}", n)
    } else {
        format!("run-{}", n)
    };
    Json(json!({"run_id": run_id, "session_id": "sess-1", "status": "queued"}))
}

async fn fetch_run(Path(run_id): Path<String>) -> Json<Value> {
    Json(json!({"run_id": run_id, "status": "running"}))
}

async fn fetch_capsule(Path(capsule_id): Path<String>) -> Json<Value> {
    Json(json!({"capsule_id": capsule_id, "name": "Teaser", "workflow": plan_output()}))
}

async fn fetch_session(Path(session_id): Path<String>) -> Response {
    if session_id != "sess-1" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Session not found"})),
        )
            .into_response();
    }
    Json(json!({
        "id": "sess-1",
        "status": "completed",
        "agent_model": "capsule-director-v1",
        "capsule_id": "cap-1",
        "messages": [
            {"role": "user", "content": "Make a teaser"},
            {"role": "assistant", "content": "Planning", "status": "complete",
             "tool_calls": [{"id": "call-1", "name": "plan_workflow"}]},
            {"role": "tool", "name": "plan_workflow", "output": plan_output()}
        ],
        "scenes": [{"scene_id": "scene-1"}, {"scene_id": "scene-2"}]
    }))
    .into_response()
}

async fn decide_session(
    Path((session_id, action)): Path<(String, String)>,
    State(state): State<Arc<Backend>>,
    Json(body): Json<Value>,
) -> StatusCode {
    if action != "approve" && action != "reject" {
        return StatusCode::NOT_FOUND;
    }
    state
        .decisions
        .lock()
        .unwrap()
        .push((session_id, action, body));
    StatusCode::NO_CONTENT
}
