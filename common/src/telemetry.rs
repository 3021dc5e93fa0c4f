// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "swag";

/// Initialize structured logging with JSON formatting and trace context
///
/// `RUST_LOG` takes precedence over `log_level`. When `tracing_endpoint` is
/// set, spans are also exported over OTLP.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");

    Ok(tracer)
}

/// Flush remaining spans; call on graceful shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter and describe the worker metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("swag_jobs_claimed_total", "Jobs claimed by fetch-and-lock");
    describe_counter!(
        "swag_jobs_succeeded_total",
        "Job handler invocations that returned successfully"
    );
    describe_counter!(
        "swag_jobs_failed_total",
        "Job handler invocations that failed or panicked"
    );
    describe_counter!(
        "swag_jobs_deleted_total",
        "Jobs removed by a flush because their schedule ended"
    );
    describe_counter!("swag_store_errors_total", "Failed job store operations");
    describe_histogram!(
        "swag_job_duration_seconds",
        "Duration of job handler invocations in seconds"
    );
    describe_gauge!(
        "swag_completion_buffer_size",
        "Completion records waiting for the next flush"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_jobs_claimed(queue: &str, count: usize) {
    counter!("swag_jobs_claimed_total", "queue" => queue.to_string()).increment(count as u64);
}

#[inline]
pub fn record_job_success(queue: &str) {
    counter!("swag_jobs_succeeded_total", "queue" => queue.to_string()).increment(1);
}

#[inline]
pub fn record_job_failure(queue: &str, reason: &str) {
    counter!(
        "swag_jobs_failed_total",
        "queue" => queue.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_jobs_deleted(queue: &str, count: usize) {
    counter!("swag_jobs_deleted_total", "queue" => queue.to_string()).increment(count as u64);
}

/// `operation` is the store call that failed, e.g. `fetch_and_lock`
#[inline]
pub fn record_store_error(queue: &str, operation: &str) {
    counter!(
        "swag_store_errors_total",
        "queue" => queue.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_job_duration(queue: &str, duration_seconds: f64) {
    histogram!("swag_job_duration_seconds", "queue" => queue.to_string()).record(duration_seconds);
}

#[inline]
pub fn update_completion_buffer_size(queue: &str, size: usize) {
    gauge!("swag_completion_buffer_size", "queue" => queue.to_string()).set(size as f64);
}
