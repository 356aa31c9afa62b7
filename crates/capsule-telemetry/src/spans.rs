//! Span helpers for run streams

use crate::attributes::*;
use tracing::Span;

/// Span covering one run's stream, entered by the transport task.
pub fn run_span(run_id: &str, transport: &str) -> Span {
    tracing::info_span!(
        RUN_STREAM_SPAN,
        system = SYSTEM_NAME,
        run_id = %run_id,
        transport = %transport,
    )
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub session_id: Option<String>,
    pub state: String,
    pub events_applied: usize,
    pub seq_anomalies: u32,
    pub message: Option<String>,
}

/// Record a run's outcome once it reaches a terminal state or its stream closes.
pub fn record_run_outcome(outcome: &RunOutcome) {
    let span = tracing::info_span!(
        RUN_OUTCOME_SPAN,
        system = SYSTEM_NAME,
        run_id = %outcome.run_id,
        session_id = outcome.session_id.as_deref().unwrap_or(""),
        state = %outcome.state,
        events_applied = outcome.events_applied,
        seq_anomalies = outcome.seq_anomalies,
    );
    let _guard = span.enter();

    match &outcome.message {
        Some(message) => tracing::warn!(reason = %message, "Run finished"),
        None => tracing::info!("Run finished"),
    }
}
