//! # Telemetry Features
//!
//! Logging is always on: a `tracing-subscriber` registry prints events to the
//! console, filtered by `RUST_LOG` (default `info`).
//!
//! Metrics are optional and exported via OpenTelemetry.
//!
//! ## Feature matrix
//!
//! - `metrics`: Enables OpenTelemetry metrics (counters, histograms, etc.).
//! - `stdout`: Enables the stdout metrics exporter.
//! - `otlp`: Enables the OTLP (gRPC) metrics exporter, configured through the
//!   standard `OTEL_EXPORTER_OTLP_*` environment variables.
//!
//! ## Feature constraints
//!
//! - Exporters require `metrics`.
//! - Both exporters can be enabled at the same time.
//!
//! ## Metrics behavior
//!
//! - Every recording function below compiles to a no-op without `metrics`.
//! - Each exporter gets its own periodic reader.
//!
//! ## Example usage
//!
//! ```bash
//! cargo run --features metrics,stdout
//! ```

// Disallow using `stdout` without `metrics`
#[cfg(all(feature = "stdout", not(feature = "metrics")))]
compile_error!("The 'stdout' feature requires the 'metrics' feature to be enabled.");

// Disallow using `otlp` without `metrics`
#[cfg(all(feature = "otlp", not(feature = "metrics")))]
compile_error!("The 'otlp' feature requires the 'metrics' feature to be enabled.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::{
    InstrumentationScope, KeyValue,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::{Resource, metrics as sdkmetrics};
#[cfg(feature = "metrics")]
use opentelemetry_semantic_conventions as semvcns;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

pub struct TelemetryProviders {
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops exporters. Errors go to stderr since logging may
    /// already be gone.
    pub fn shutdown(&self) {
        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        )
        .try_init()?;

    #[cfg(feature = "metrics")]
    {
        let scope = InstrumentationScope::builder("tally")
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(semvcns::SCHEMA_URL)
            .build();
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        init_metric_handles(opentelemetry::global::meter_with_scope(scope));
    }

    Ok(TelemetryProviders {
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "metrics")]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("tally")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .build()
            .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

// Metric handles - only compiled when metrics feature is enabled
#[cfg(feature = "metrics")]
static ALLOCATIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ALLOCATION_FAILURES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static BACKPRESSURE_REJECTIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASKS_SUCCEEDED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASKS_RETRIED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASKS_DEAD: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASK_BACKLOG: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static INDEX_FAILURES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static COUNTER_DRIFT_CORRECTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static SEQUENCE_GAPS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASK_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = ALLOCATIONS.set(
        meter
            .u64_counter("allocations")
            .with_description("Sequence numbers handed out")
            .build(),
    );

    let _ = ALLOCATION_FAILURES.set(
        meter
            .u64_counter("allocation_failures")
            .with_description("Allocations failed fast on an unavailable counter store")
            .build(),
    );

    let _ = BACKPRESSURE_REJECTIONS.set(
        meter
            .u64_counter("backpressure_rejections")
            .with_description("Requests rejected on a full backlog")
            .build(),
    );

    let _ = TASKS_SUCCEEDED.set(
        meter
            .u64_counter("tasks_succeeded")
            .with_description("Creation tasks persisted")
            .build(),
    );

    let _ = TASKS_RETRIED.set(
        meter
            .u64_counter("tasks_retried")
            .with_description("Creation attempts scheduled for retry")
            .build(),
    );

    let _ = TASKS_DEAD.set(
        meter
            .u64_counter("tasks_dead")
            .with_description("Creation tasks dead-lettered")
            .build(),
    );

    let _ = TASK_BACKLOG.set(
        meter
            .i64_up_down_counter("task_backlog")
            .with_description("Admitted creation tasks not yet terminal")
            .build(),
    );

    let _ = INDEX_FAILURES.set(
        meter
            .u64_counter("index_failures")
            .with_description("Search index writes that failed or timed out")
            .build(),
    );

    let _ = COUNTER_DRIFT_CORRECTED.set(
        meter
            .u64_counter("counter_drift_corrected")
            .with_description("Cached child counts overwritten by a sweep")
            .build(),
    );

    let _ = SEQUENCE_GAPS.set(
        meter
            .u64_counter("sequence_gaps")
            .with_description("Allocated numbers abandoned without a row")
            .build(),
    );

    let _ = TASK_DURATION_MS.set(
        meter
            .f64_histogram("task_duration")
            .with_unit("ms")
            .with_description("Enqueue-to-commit latency of creation tasks")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_allocations() {
    if let Some(counter) = ALLOCATIONS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_allocations() {}

#[cfg(feature = "metrics")]
pub fn increment_allocation_failures() {
    if let Some(counter) = ALLOCATION_FAILURES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_allocation_failures() {}

#[cfg(feature = "metrics")]
pub fn increment_backpressure_rejections() {
    if let Some(counter) = BACKPRESSURE_REJECTIONS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_backpressure_rejections() {}

#[cfg(feature = "metrics")]
pub fn increment_tasks_succeeded() {
    if let Some(counter) = TASKS_SUCCEEDED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tasks_succeeded() {}

#[cfg(feature = "metrics")]
pub fn increment_tasks_retried() {
    if let Some(counter) = TASKS_RETRIED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tasks_retried() {}

#[cfg(feature = "metrics")]
pub fn increment_tasks_dead() {
    if let Some(counter) = TASKS_DEAD.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tasks_dead() {}

#[cfg(feature = "metrics")]
pub fn increment_task_backlog() {
    if let Some(counter) = TASK_BACKLOG.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_task_backlog() {}

#[cfg(feature = "metrics")]
pub fn decrement_task_backlog() {
    if let Some(counter) = TASK_BACKLOG.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_task_backlog() {}

#[cfg(feature = "metrics")]
pub fn increment_index_failures() {
    if let Some(counter) = INDEX_FAILURES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_index_failures() {}

#[cfg(feature = "metrics")]
pub fn add_counter_drift_corrected(count: u64) {
    if let Some(counter) = COUNTER_DRIFT_CORRECTED.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn add_counter_drift_corrected(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn add_sequence_gaps(count: u64) {
    if let Some(counter) = SEQUENCE_GAPS.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn add_sequence_gaps(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn record_task_duration(duration_ms: f64) {
    if let Some(histogram) = TASK_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_task_duration(_duration_ms: f64) {}
