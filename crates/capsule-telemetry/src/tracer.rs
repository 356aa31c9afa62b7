//! Tracer setup and management

use capsule_core::ObservabilityConfig;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::export::trace::SpanExporter;
use opentelemetry_sdk::trace::{Builder, TracerProvider};
use std::sync::{Arc, Mutex, OnceLock};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Global tracer provider holder
static TRACER_PROVIDER: OnceLock<Arc<TracerProvider>> = OnceLock::new();

/// Exporters registered before initialization, applied to the provider builder
type ExporterSetup = Box<dyn FnOnce(Builder) -> Builder + Send>;
static SPAN_EXPORTERS: Mutex<Option<Vec<ExporterSetup>>> = Mutex::new(Some(Vec::new()));

/// Register a span exporter used when telemetry is initialized.
///
/// Each exporter is wired through a simple (unbatched) span processor. Must be
/// called before [`init_telemetry`]; later registrations are dropped with a
/// warning.
pub fn register_span_exporter<E: SpanExporter + 'static>(exporter: E) {
    let mut exporters = match SPAN_EXPORTERS.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    if let Some(ref mut vec) = *exporters {
        vec.push(Box::new(move |builder: Builder| builder.with_simple_exporter(exporter)));
    } else {
        tracing::warn!("Attempted to register span exporter after telemetry initialization");
    }
}

/// Initialize logging and tracing.
///
/// This sets up:
/// - A tracer provider with any registered span exporters
/// - An OpenTelemetry layer on the tracing subscriber
/// - Text or JSON log output, filtered by `RUST_LOG` or the configured filter
///
/// Returns an error when a global subscriber is already installed.
///
/// # Example
///
/// ```rust,no_run
/// use capsule_core::ObservabilityConfig;
/// use capsule_telemetry::init_telemetry;
///
/// init_telemetry(&ObservabilityConfig::default()).ok();
/// ```
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<(), TryInitError> {
    let exporters = match SPAN_EXPORTERS.lock() {
        Ok(mut guard) => guard.take().unwrap_or_default(),
        Err(poisoned) => poisoned.into_inner().take().unwrap_or_default(),
    };

    let mut provider_builder = TracerProvider::builder();
    for setup in exporters {
        provider_builder = setup(provider_builder);
    }
    let tracer_provider = provider_builder.build();

    let service_name = config
        .service_name
        .clone()
        .unwrap_or_else(|| crate::attributes::SYSTEM_NAME.to_string());
    let tracer = tracer_provider.tracer(service_name);

    let _ = TRACER_PROVIDER.set(Arc::new(tracer_provider));

    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    let json = config.log_format == "json";
    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
    });
    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_thread_ids(false)
            .with_line_number(true)
    });

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    tracing_subscriber::registry()
        .with(telemetry_layer)
        .with(json_layer)
        .with(text_layer)
        .with(filter)
        .try_init()
}

/// Get the global tracer provider if initialized
pub fn tracer_provider() -> Option<Arc<TracerProvider>> {
    TRACER_PROVIDER.get().cloned()
}
