use std::error::Error;

use opentelemetry::{
    global, logs::LogError, propagation::TextMapCompositePropagator, KeyValue,
};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    logs::Config, propagation::TraceContextPropagator, runtime, trace, Resource,
};
use tracing_core::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::Settings;

/// Sets up tracing and logging via the otlp exporter, plus JSON logs on
/// stdout.
///
/// Incoming trace context is accepted in both W3C `traceparent` and Jaeger
/// `uber-trace-id` form. The level defaults to INFO and can be overridden
/// through `RUST_LOG`.
///
/// This should generally be the first statement of any server binary's main
/// function, and must run inside a tokio runtime.
pub fn setup(settings: &Settings) -> Result<(), Box<dyn Error>> {
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(opentelemetry_jaeger_propagator::Propagator::new()),
    ]));

    // needs to run before init_tracer
    init_logs(settings)?;
    init_tracer(settings)?;

    tracing::info!(
        service = %settings.service_name,
        environment = %settings.environment,
        "starting server"
    );
    Ok(())
}

fn resource(settings: &Settings) -> Resource {
    Resource::new(vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            settings.service_name.clone(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::DEPLOYMENT_ENVIRONMENT,
            settings.environment.clone(),
        ),
    ])
}

fn init_tracer(settings: &Settings) -> Result<(), Box<dyn Error>> {
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(settings.otlp_endpoint.clone()),
        )
        .with_trace_config(trace::config().with_resource(resource(settings)))
        .install_batch(runtime::Tokio)?;

    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let log_layer = OpenTelemetryTracingBridge::new(&global::logger_provider());
    let stdout = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(false);

    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy()
        }))
        .with(telemetry)
        .with(log_layer)
        .with(stdout)
        .try_init()?;

    Ok(())
}

fn init_logs(settings: &Settings) -> Result<(), LogError> {
    opentelemetry_otlp::new_pipeline()
        .logging()
        .with_log_config(Config::default().with_resource(resource(settings)))
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(settings.otlp_endpoint.clone()),
        )
        .install_batch(runtime::Tokio)?;

    Ok(())
}

/// Flushes and shuts down the exporters installed by [`setup`].
pub fn teardown() {
    global::shutdown_logger_provider();
    global::shutdown_tracer_provider();
}
