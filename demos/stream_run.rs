//! Example: send one message and follow the run it starts
//!
//! This example shows how to:
//! - Load `capsule.toml` (or fall back to a local backend)
//! - Initialize logging and tracing
//! - Stream a run through the session orchestrator
//! - Cancel it with Ctrl-C
//!
//! ```bash
//! cargo run --example stream_run -- "Make a 30 second teaser"
//! ```

use capsule_core::ClientConfig;
use capsule_session::{
    AgentMessage, HttpSessionApi, SendOverrides, SessionOrchestrator, SessionUpdate,
};
use capsule_telemetry::init_telemetry;
use capsule_transport::ConnectionManager;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match ClientConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("No usable capsule.toml ({}), using local defaults", e);
            ClientConfig::test_defaults()
        }
    };
    init_telemetry(&config.observability)?;

    let message = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Make a 30 second teaser".to_string());

    let api = HttpSessionApi::from_config(&config)?;
    let manager = ConnectionManager::new(&config)?;
    println!("Transport: {}", manager.selected_transport());

    let mut orchestrator =
        SessionOrchestrator::new(Arc::new(api), Arc::new(manager), &config.session);
    let run_id = orchestrator
        .send_message(&message, SendOverrides::default())
        .await?;
    println!("Run started: {}\n", run_id);

    loop {
        let update = tokio::select! {
            update = orchestrator.next_update() => update,
            _ = tokio::signal::ctrl_c() => {
                println!("Cancelling...");
                orchestrator.stop().await?;
                continue;
            }
        };

        match update {
            Some(SessionUpdate::Opened { transport, .. }) => println!("Connected over {}", transport),
            Some(SessionUpdate::Applied { event_type, state, .. }) => {
                println!("  {} -> {:?}", event_type, state)
            }
            Some(SessionUpdate::Ignored { event_type, reason, .. }) => {
                println!("  {} ignored ({:?})", event_type, reason)
            }
            Some(SessionUpdate::StreamError { error, .. }) => eprintln!("  stream error: {}", error),
            Some(SessionUpdate::Closed { state, .. }) => println!("Stream closed at {:?}", state),
            None => break,
        }
    }

    let session = orchestrator.session();
    println!("\nSession status: {:?}", session.status);
    if let Some(AgentMessage::Assistant { content, .. }) = session
        .messages
        .iter()
        .rev()
        .find(|m| matches!(m, AgentMessage::Assistant { .. }))
    {
        println!("Assistant: {}", content);
    }
    if let Some(plan) = &session.latest_plan {
        println!(
            "Plan {}: {} nodes, {} edges",
            plan.workflow_id,
            plan.nodes.len(),
            plan.edges.len()
        );
    }
    println!("Scenes: {}", session.scenes.len());

    Ok(())
}
