use anyhow::{Context, Result};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::SdkMeterProvider, Resource};
use std::time::Duration;
use tracing::info;

/// Control-plane metrics exported over OTLP.
pub struct ServerMetrics {
    pub request_latency: Histogram<f64>,
    pub requests: Counter<u64>,
    pub dropped_events: Counter<u64>,
    pub approval_decisions: Counter<u64>,
    pub redaction_findings: Counter<u64>,
    pub audit_failures: Counter<u64>,
}

impl ServerMetrics {
    pub fn new(meter: &Meter) -> Self {
        let request_latency = meter
            .f64_histogram("ntm.http.request.latency_ms")
            .with_description("HTTP request latency in milliseconds")
            .build();

        let requests = meter
            .u64_counter("ntm.http.requests")
            .with_description("HTTP requests by route and status")
            .build();

        let dropped_events = meter
            .u64_counter("ntm.events.dropped")
            .with_description("Events not delivered to a WebSocket client")
            .build();

        let approval_decisions = meter
            .u64_counter("ntm.approvals.decisions")
            .with_description("Approval decisions by outcome")
            .build();

        let redaction_findings = meter
            .u64_counter("ntm.redaction.findings")
            .with_description("Secrets found in request or response bodies")
            .build();

        let audit_failures = meter
            .u64_counter("ntm.audit.write_failures")
            .with_description("Audit records that could not be written")
            .build();

        Self {
            request_latency,
            requests,
            dropped_events,
            approval_decisions,
            redaction_findings,
            audit_failures,
        }
    }

    pub fn record_request(&self, method: &str, route: &str, status: u16, duration_ms: f64) {
        let attrs = [
            KeyValue::new("method", method.to_string()),
            KeyValue::new("route", route.to_string()),
            KeyValue::new("status", i64::from(status)),
        ];
        self.request_latency.record(duration_ms, &attrs);
        self.requests.add(1, &attrs);
    }

    pub fn record_dropped(&self, reason: &str, count: u64) {
        self.dropped_events
            .add(count, &[KeyValue::new("reason", reason.to_string())]);
    }

    pub fn record_approval(&self, outcome: &str) {
        self.approval_decisions
            .add(1, &[KeyValue::new("outcome", outcome.to_string())]);
    }

    pub fn record_redaction(&self, category: &str, direction: &str, count: u64) {
        self.redaction_findings.add(
            count,
            &[
                KeyValue::new("category", category.to_string()),
                KeyValue::new("direction", direction.to_string()),
            ],
        );
    }

    pub fn record_audit_failure(&self) {
        self.audit_failures.add(1, &[]);
    }
}

/// Installs the global meter provider exporting to `endpoint`.
pub fn init_metrics(endpoint: &str, service_name: &str) -> Result<(SdkMeterProvider, ServerMetrics)> {
    info!(endpoint, "initializing OTLP metrics");

    let export_config = opentelemetry_otlp::ExportConfig {
        endpoint: Some(endpoint.to_string()),
        timeout: Duration::from_secs(10),
        ..Default::default()
    };

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_export_config(export_config)
        .build()
        .context("building OTLP metric exporter")?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(
        exporter,
        opentelemetry_sdk::runtime::Tokio,
    )
    .with_interval(Duration::from_secs(30))
    .build();

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());

    let meter = global::meter("ntm-server");
    Ok((provider, ServerMetrics::new(&meter)))
}

pub fn shutdown_metrics(provider: SdkMeterProvider) -> Result<()> {
    info!("shutting down OTLP metrics");
    provider
        .shutdown()
        .context("shutting down meter provider")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::metrics::MeterProvider;

    #[test]
    fn instruments_accept_records() {
        let provider = SdkMeterProvider::builder().build();
        let meter = provider.meter("test");
        let metrics = ServerMetrics::new(&meter);

        metrics.record_request("GET", "/api/v1/sessions", 200, 3.5);
        metrics.record_dropped("buffer_full", 4);
        metrics.record_approval("approved");
        metrics.record_redaction("OPENAI_KEY", "response", 2);
        metrics.record_audit_failure();
    }
}
