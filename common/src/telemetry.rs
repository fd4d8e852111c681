// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
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

/// Initialize structured logging with JSON formatting and trace context.
///
/// `RUST_LOG` wins over `log_level` when set. When `tracing_endpoint` is given,
/// spans are also exported over OTLP.
pub fn init_logging(service_name: &'static str, log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
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
        let tracer = init_tracer(service_name, endpoint)?;
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
        service_name,
        log_level,
        tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
fn init_tracer(service_name: &'static str, endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
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
                    KeyValue::new("service.name", service_name),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    Ok(tracer_provider.tracer(service_name))
}

/// Flush remaining spans on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter and describe the scrape-core metrics
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("scrape_runs_enqueued_total", "Fetch tasks enqueued by the scheduler");
    describe_counter!("scrape_runs_failed_total", "Scrape runs failed before or at enqueue");
    describe_counter!(
        "schedule_lock_contention_total",
        "Schedules skipped because another instance held the source lock"
    );
    describe_counter!("records_ingested_total", "Scraped records by ingestion outcome");
    describe_counter!("review_jobs_enqueued_total", "Records forwarded to the review queue");
    describe_gauge!("review_pending_gauge", "Records waiting in pending_review");

    tracing::info!(metrics_port, "Prometheus metrics exporter initialized");

    Ok(())
}

#[inline]
pub fn record_run_enqueued(source_name: &str) {
    counter!("scrape_runs_enqueued_total", "source" => source_name.to_string()).increment(1);
}

#[inline]
pub fn record_run_failed(source_name: &str, reason: &'static str) {
    counter!("scrape_runs_failed_total", "source" => source_name.to_string(), "reason" => reason).increment(1);
}

#[inline]
pub fn record_lock_contention(source_name: &str) {
    counter!("schedule_lock_contention_total", "source" => source_name.to_string()).increment(1);
}

#[inline]
pub fn record_ingest_outcome(source_name: &str, outcome: &'static str) {
    counter!("records_ingested_total", "source" => source_name.to_string(), "outcome" => outcome).increment(1);
}

#[inline]
pub fn record_review_enqueued(count: usize) {
    counter!("review_jobs_enqueued_total").increment(count as u64);
}

#[inline]
pub fn update_review_pending(size: i64) {
    gauge!("review_pending_gauge").set(size as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording_without_exporter() {
        // No recorder installed: calls are no-ops and must not panic
        record_run_enqueued("ExampleSite");
        record_run_failed("ExampleSite", "payload_parse");
        record_lock_contention("ExampleSite");
        record_ingest_outcome("ExampleSite", "inserted");
        record_review_enqueued(3);
        update_review_pending(7);
    }
}
