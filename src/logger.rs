use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider};
use tracing::warn;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub const SERVICE_NAME: &str = "mg-bridge";

/// Target of the one-line-per-reconcile JSON events.
pub const RECONCILE_TARGET: &str = "reconcile";

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(end_point: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(end_point: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

/// Keeps the OTLP providers alive; dropping it without `shutdown` loses
/// whatever is still batched.
pub struct Telemetry {
    logger_provider: Option<SdkLoggerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    pub fn otel_enabled(&self) -> bool {
        self.logger_provider.is_some()
    }

    pub fn shutdown(self) {
        if let Some(provider) = self.logger_provider {
            if let Err(err) = provider.shutdown() {
                warn!("could not flush OTLP logs: {err}");
            }
        }
        if let Some(provider) = self.meter_provider {
            if let Err(err) = provider.shutdown() {
                warn!("could not flush OTLP metrics: {err}");
            }
        }
    }
}

/// Install the global subscriber.
///
/// - stdout and `<root>/<log_file>` get everything `log_level` lets through
/// - `<root>/<event_file>` gets newline-delimited JSON for `target: "reconcile"` only
/// - with `otel_endpoint`, logs and worker metrics are also shipped over OTLP/HTTP
pub fn init_tracing(
    root: &Path,
    log_file: &str,
    event_file: &str,
    log_level: &str,
    otel_endpoint: Option<&str>,
) -> Result<Telemetry> {
    let log_path = root.join(log_file);
    let event_path = root.join(event_file);

    let txt_appender = rolling(&log_path)?;
    let txt_layer = fmt::layer()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level));

    let json_appender = rolling(&event_path)?;
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{RECONCILE_TARGET}=info")));

    let stdout_layer = fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new(log_level));

    let (logger_provider, meter_provider) = match otel_endpoint {
        Some(endpoint) => {
            let logs = init_logs(endpoint)?;
            let metrics = init_metrics(endpoint)?;
            global::set_meter_provider(metrics.clone());
            (Some(logs), Some(metrics))
        }
        None => (None, None),
    };

    let otel_layer = logger_provider.as_ref().map(|provider| {
        // exporter transports must not feed their own logs back into OTLP
        let filter = EnvFilter::new(format!("{log_level},hyper=off,tonic=off,h2=off,reqwest=off"));
        OpenTelemetryTracingBridge::new(provider).with_filter(filter)
    });

    Registry::default()
        .with(stdout_layer)
        .with(txt_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(Telemetry {
        logger_provider,
        meter_provider,
    })
}

fn rolling(path: &Path) -> Result<RollingFileAppender> {
    let dir = path
        .parent()
        .with_context(|| format!("log path {} has no directory", path.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("log path {} has no file name", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(RollingFileAppender::new(Rotation::DAILY, dir, file_name))
}

/// Worker lifecycle counters. Backed by the global meter, which is a no-op
/// until `init_tracing` wires an OTLP endpoint.
#[derive(Clone)]
pub struct BridgeMetrics {
    pub workers_started: Counter<u64>,
    pub workers_stopped: Counter<u64>,
    pub start_failures: Counter<u64>,
    pub reconcile_latency_ms: Histogram<f64>,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            workers_started: meter
                .u64_counter("workers_started")
                .with_description("Workers started, including restarts")
                .build(),
            workers_stopped: meter
                .u64_counter("workers_stopped")
                .build(),
            start_failures: meter
                .u64_counter("worker_start_failures")
                .build(),
            reconcile_latency_ms: meter
                .f64_histogram("reconcile_latency_ms")
                .with_description("Latency per reconcile in ms")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn record_reconcile(&self, action: &'static str, elapsed_ms: f64) {
        self.reconcile_latency_ms
            .record(elapsed_ms, &[KeyValue::new("action", action)]);
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BridgeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BridgeMetrics")
    }
}
