//! Per-run lifecycle state machine
//!
//! `Queued -> Started -> {Progress <-> Partial}* -> {Completed | Failed | Cancelled}`
//!
//! Once a terminal state is reached every later event for the run is ignored.
//! Retries are new runs with new ids; nothing here is retry-aware.

use crate::event::{RunEvent, RunEventType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Started,
    Progress,
    Partial,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Started => "started",
            RunState::Progress => "progress",
            RunState::Partial => "partial",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    /// Position in the forward order; Progress and Partial share a rank.
    fn rank(self) -> u8 {
        match self {
            RunState::Queued => 0,
            RunState::Started => 1,
            RunState::Progress | RunState::Partial => 2,
            RunState::Completed | RunState::Failed | RunState::Cancelled => 3,
        }
    }
}

impl From<RunEventType> for RunState {
    fn from(ty: RunEventType) -> Self {
        match ty {
            RunEventType::Queued => RunState::Queued,
            RunEventType::Started => RunState::Started,
            RunEventType::Progress => RunState::Progress,
            RunEventType::Partial => RunState::Partial,
            RunEventType::Completed => RunState::Completed,
            RunEventType::Failed => RunState::Failed,
            RunEventType::Cancelled => RunState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The run already reached a terminal state.
    Terminal,
    /// Same `event_id` was applied before.
    Duplicate,
    /// Event belongs to a different run.
    ForeignRun,
    /// Event would move the state backwards.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Transition { from: RunState, to: RunState },
    Ignored(IgnoreReason),
}

impl Applied {
    pub fn is_applied(&self) -> bool {
        matches!(self, Applied::Transition { .. })
    }
}

/// Tracks one run's state and the artifacts accumulated from its events.
#[derive(Debug, Clone)]
pub struct RunLifecycle {
    run_id: String,
    state: RunState,
    seen_events: HashSet<String>,
    last_seq: Option<u64>,
    seq_anomalies: u32,
    progress: Option<f64>,
    partials: Vec<Map<String, Value>>,
    output: Option<Value>,
    failure: Option<String>,
}

impl RunLifecycle {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            state: RunState::Queued,
            seen_events: HashSet::new(),
            last_seq: None,
            seq_anomalies: 0,
            progress: None,
            partials: Vec::new(),
            output: None,
            failure: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn progress(&self) -> Option<f64> {
        self.progress
    }

    pub fn partials(&self) -> &[Map<String, Value>] {
        &self.partials
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Number of gaps or regressions observed in `seq`.
    pub fn seq_anomalies(&self) -> u32 {
        self.seq_anomalies
    }

    /// Apply one event in arrival order.
    pub fn apply(&mut self, event: &RunEvent) -> Applied {
        if self.state.is_terminal() {
            return Applied::Ignored(IgnoreReason::Terminal);
        }

        if event.owner_id() != self.run_id {
            tracing::debug!(
                run_id = %self.run_id,
                other = %event.owner_id(),
                "Ignoring event for another run"
            );
            return Applied::Ignored(IgnoreReason::ForeignRun);
        }

        if let Some(id) = &event.event_id
            && self.seen_events.contains(id)
        {
            return Applied::Ignored(IgnoreReason::Duplicate);
        }

        let next = RunState::from(event.event_type);
        if next.rank() < self.state.rank() {
            tracing::debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "Ignoring stale event");
            return Applied::Ignored(IgnoreReason::Stale);
        }

        if let Some(id) = &event.event_id {
            self.seen_events.insert(id.clone());
        }
        self.track_seq(event.seq);
        self.absorb(event);

        let from = self.state;
        self.state = next;
        if from != next {
            tracing::info!(run_id = %self.run_id, ?from, to = ?next, "Run state changed");
        }
        Applied::Transition { from, to: next }
    }

    fn track_seq(&mut self, seq: Option<u64>) {
        let Some(seq) = seq else { return };
        match self.last_seq {
            Some(last) if seq <= last => {
                self.seq_anomalies += 1;
                tracing::warn!(run_id = %self.run_id, last, seq, "Out-of-order seq");
                return;
            }
            Some(last) if seq > last + 1 => {
                self.seq_anomalies += 1;
                tracing::warn!(run_id = %self.run_id, expected = last + 1, seq, "Gap in seq");
            }
            _ => {}
        }
        self.last_seq = Some(seq);
    }

    fn absorb(&mut self, event: &RunEvent) {
        let payload = &event.payload;
        match event.event_type {
            RunEventType::Progress => {
                if let Some(p) = payload.get("progress").and_then(Value::as_f64) {
                    self.progress = Some(p);
                }
            }
            RunEventType::Partial => self.partials.push(payload.clone()),
            RunEventType::Completed => {
                self.progress = Some(1.0);
                self.output = payload
                    .get("output")
                    .cloned()
                    .or_else(|| (!payload.is_empty()).then(|| Value::Object(payload.clone())));
            }
            RunEventType::Failed => {
                let message = payload
                    .get("error")
                    .or_else(|| payload.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("Run failed");
                self.failure = Some(message.to_string());
            }
            RunEventType::Queued | RunEventType::Started | RunEventType::Cancelled => {}
        }
    }
}
