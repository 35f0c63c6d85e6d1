//! OpenTelemetry export of the collector's own health counters.
//!
//! Export is enabled only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set. Without
//! it every `record_*` helper is a no-op.

use anyhow::{Context, Result};
use log::{info, warn};
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<SchedWatchMetrics> = OnceLock::new();

static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Attached link count per program kind, read by the observable gauge.
static ATTACHED_LINKS: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn attached_links_map() -> &'static RwLock<HashMap<String, u64>> {
    ATTACHED_LINKS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: counter names carry no `_total` suffix; Prometheus adds it.
pub struct SchedWatchMetrics {
    pub events_received: Counter<u64>,
    pub decode_errors: Counter<u64>,
    pub sink_errors: Counter<u64>,
    pub events_lost: Counter<u64>,
    pub batches_flushed: Counter<u64>,
}

impl SchedWatchMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            events_received: meter
                .u64_counter("sched_events_received")
                .with_description("Samples read from the sched_events perf buffer")
                .with_unit("events")
                .build(),
            decode_errors: meter
                .u64_counter("sched_decode_errors")
                .with_description("Samples that could not be decoded")
                .with_unit("events")
                .build(),
            sink_errors: meter
                .u64_counter("sched_sink_errors")
                .with_description("Events the output sink failed to accept")
                .with_unit("events")
                .build(),
            events_lost: meter
                .u64_counter("sched_events_lost")
                .with_description("Samples dropped by the kernel before they were read")
                .with_unit("events")
                .build(),
            batches_flushed: meter
                .u64_counter("sched_batches_flushed")
                .with_description("Columnar batches sent to ClickHouse")
                .with_unit("batches")
                .build(),
        }
    }
}

fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize the OTLP metrics pipeline (gRPC).
pub fn init_metrics() -> Result<()> {
    let Some(endpoint) = get_otlp_endpoint() else {
        info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Self-metrics export disabled.");
        return Ok(());
    };

    info!("Exporting self-metrics to {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "schedwatch"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("schedwatch");

    let _attached_links_gauge = meter
        .u64_observable_gauge("attached_links")
        .with_description("Scheduler programs currently attached")
        .with_unit("links")
        .with_callback(|observer| {
            if let Ok(links) = attached_links_map().read() {
                for (kind, count) in links.iter() {
                    observer.observe(*count, &[KeyValue::new("kind", kind.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(SchedWatchMetrics::new(&meter));
    Ok(())
}

pub fn metrics() -> Option<&'static SchedWatchMetrics> {
    METRICS.get()
}

pub fn record_event_received() {
    if let Some(m) = metrics() {
        m.events_received.add(1, &[]);
    }
}

pub fn record_decode_error() {
    if let Some(m) = metrics() {
        m.decode_errors.add(1, &[]);
    }
}

pub fn record_sink_error(sink: &'static str) {
    if let Some(m) = metrics() {
        m.sink_errors.add(1, &[KeyValue::new("sink", sink)]);
    }
}

pub fn record_events_lost(count: u64) {
    if let Some(m) = metrics() {
        m.events_lost.add(count, &[]);
    }
}

pub fn record_batch_flushed() {
    if let Some(m) = metrics() {
        m.batches_flushed.add(1, &[]);
    }
}

/// Publish the attached link count for one program kind.
pub fn record_attached_links(kind: &str, count: u64) {
    if let Ok(mut links) = attached_links_map().write() {
        links.insert(kind.to_string(), count);
    }
}

/// Flush pending metrics and shut the provider down.
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
