//! Telemetry and observability setup

use crate::config::{LogFormat, ObservabilityConfig};
use crate::error::{Error, Result};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{self, RandomIdGenerator, Sampler},
    Resource,
};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Initialize telemetry subsystems
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    let registry = Registry::default().with(env_filter).with(fmt_layer);

    // Export spans over OTLP only when both the flag and an endpoint are set
    match (config.tracing_enabled, &config.otlp_endpoint) {
        (true, Some(endpoint)) => {
            let tracer = init_tracer(endpoint)?;
            let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            registry.with(telemetry_layer).init();
        }
        _ => registry.init(),
    }

    Ok(())
}

/// Initialize the OTLP tracer pipeline
fn init_tracer(endpoint: &str) -> Result<trace::Tracer> {
    let resource = Resource::new(vec![
        KeyValue::new("service.name", "flowlane"),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(
            trace::config()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_max_events_per_span(64)
                .with_max_attributes_per_span(16)
                .with_resource(resource),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(|e| Error::Internal(format!("failed to install tracer: {e}")))
}

/// Shutdown telemetry gracefully
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

/// Span builder for consistent span creation
pub struct SpanBuilder {
    name: &'static str,
    workflow_id: Option<String>,
    task_id: Option<String>,
    lane: Option<String>,
}

impl SpanBuilder {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            workflow_id: None,
            task_id: None,
            lane: None,
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }

    pub fn build(self) -> tracing::Span {
        tracing::info_span!(
            "operation",
            name = self.name,
            workflow.id = self.workflow_id.as_deref(),
            task.id = self.task_id.as_deref(),
            lane = self.lane.as_deref(),
        )
    }
}
