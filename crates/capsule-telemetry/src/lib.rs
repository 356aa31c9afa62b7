//! Logging and tracing setup for the capsule client
//!
//! Transports open one span per run stream; everything logged while decoding
//! or applying that run's events is nested under it.

pub mod attributes;
pub mod spans;
pub mod tracer;

pub use spans::{RunOutcome, record_run_outcome, run_span};
pub use tracer::{init_telemetry, register_span_exporter, tracer_provider};
