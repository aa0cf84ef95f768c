//! Observability: tracing subscriber setup, OTLP export and metrics
//!
//! Traces and metrics are exported over OTLP/gRPC when enabled. Otherwise a
//! local meter provider still backs the counters so call sites never branch.

use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, MeterProvider as _},
    trace::TracerProvider as _,
    KeyValue,
};
use opentelemetry_sdk::{metrics::SdkMeterProvider, trace::TracerProvider, Resource};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LoggingConfig, OtelConfig};

/// OpenTelemetry error types
#[derive(Debug, Error)]
pub enum OtelError {
    #[error("Failed to initialize tracer: {0}")]
    TracerInit(String),

    #[error("Failed to initialize meter: {0}")]
    MeterInit(String),

    #[error("Failed to shutdown: {0}")]
    Shutdown(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Owns the tracer and meter providers for the process lifetime
pub struct OtelProvider {
    tracer_provider: Option<TracerProvider>,
    meter_provider: SdkMeterProvider,
    service_name: String,
}

impl OtelProvider {
    pub fn new(config: &OtelConfig) -> Result<Self, OtelError> {
        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]);

        if !config.enabled {
            return Ok(Self {
                tracer_provider: None,
                meter_provider: SdkMeterProvider::builder().with_resource(resource).build(),
                service_name: config.service_name.clone(),
            });
        }

        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| OtelError::Config("OTLP endpoint is required when enabled".into()))?;

        let tracer_provider = Self::otlp_tracer_provider(endpoint, &resource)?;
        let meter_provider = Self::otlp_meter_provider(endpoint, &resource)?;
        global::set_tracer_provider(tracer_provider.clone());

        Ok(Self {
            tracer_provider: Some(tracer_provider),
            meter_provider,
            service_name: config.service_name.clone(),
        })
    }

    fn otlp_tracer_provider(endpoint: &str, resource: &Resource) -> Result<TracerProvider, OtelError> {
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::runtime;
        use opentelemetry_sdk::trace::{Config, Sampler};

        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint)
            .build_span_exporter()
            .map_err(|e| OtelError::TracerInit(e.to_string()))?;

        Ok(TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_config(
                Config::default()
                    .with_sampler(Sampler::AlwaysOn)
                    .with_resource(resource.clone()),
            )
            .build())
    }

    fn otlp_meter_provider(endpoint: &str, resource: &Resource) -> Result<SdkMeterProvider, OtelError> {
        use opentelemetry_otlp::{MetricsExporterBuilder, WithExportConfig};
        use opentelemetry_sdk::metrics::reader::{
            DefaultAggregationSelector, DefaultTemporalitySelector,
        };
        use opentelemetry_sdk::{metrics::PeriodicReader, runtime};

        let exporter = MetricsExporterBuilder::from(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .build_metrics_exporter(
            Box::new(DefaultTemporalitySelector::new()),
            Box::new(DefaultAggregationSelector::new()),
        )
        .map_err(|e| OtelError::MeterInit(e.to_string()))?;

        Ok(SdkMeterProvider::builder()
            .with_resource(resource.clone())
            .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
            .build())
    }

    /// Tracer for the tracing-opentelemetry layer
    pub fn tracer(&self, name: &'static str) -> opentelemetry_sdk::trace::Tracer {
        match &self.tracer_provider {
            Some(tp) => tp.tracer(name),
            None => TracerProvider::builder().build().tracer(name),
        }
    }

    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(self.service_name.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.tracer_provider.is_some()
    }

    /// Flush spans and stop the meter provider
    pub fn shutdown(&self) -> Result<(), OtelError> {
        self.meter_provider
            .shutdown()
            .map_err(|e| OtelError::Shutdown(format!("meter: {:?}", e)))?;
        if let Some(tp) = &self.tracer_provider {
            for result in tp.force_flush() {
                result.map_err(|e| OtelError::Shutdown(format!("tracer: {:?}", e)))?;
            }
        }
        Ok(())
    }
}

impl Drop for OtelProvider {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Counters and histograms for the registry
pub struct Metrics {
    pub requests_total: Counter<u64>,
    pub request_duration: Histogram<f64>,
    pub cache_hits_total: Counter<u64>,
    pub cache_misses_total: Counter<u64>,
    pub upstream_fetches_total: Counter<u64>,
    pub stale_serves_total: Counter<u64>,
    pub coalesced_waits_total: Counter<u64>,
    pub evictions_total: Counter<u64>,
    pub upstream_duration: Histogram<f64>,
}

impl Metrics {
    pub fn new(meter: &Meter) -> Self {
        let counter = |name: &'static str, description: &'static str| {
            meter.u64_counter(name).with_description(description).init()
        };
        Self {
            requests_total: counter("artifact_depot_requests_total", "Requests served"),
            request_duration: meter
                .f64_histogram("artifact_depot_request_duration_seconds")
                .with_description("Request processing duration in seconds")
                .init(),
            cache_hits_total: counter(
                "artifact_depot_cache_hits_total",
                "Proxy requests answered from cache without contacting upstream",
            ),
            cache_misses_total: counter(
                "artifact_depot_cache_misses_total",
                "Proxy requests with no cached copy",
            ),
            upstream_fetches_total: counter(
                "artifact_depot_upstream_fetches_total",
                "Requests sent to upstream registries",
            ),
            stale_serves_total: counter(
                "artifact_depot_stale_serves_total",
                "Cached copies served because upstream was unavailable",
            ),
            coalesced_waits_total: counter(
                "artifact_depot_coalesced_waits_total",
                "Requests that joined an in-flight upstream fetch",
            ),
            evictions_total: counter(
                "artifact_depot_cache_evictions_total",
                "Cache entries removed by the sweep",
            ),
            upstream_duration: meter
                .f64_histogram("artifact_depot_upstream_duration_seconds")
                .with_description("Upstream fetch duration in seconds")
                .init(),
        }
    }

    /// Metrics backed by a local provider that exports nowhere
    pub fn noop() -> Self {
        Self::new(&SdkMeterProvider::builder().build().meter("artifact-depot"))
    }

    pub fn record_request(&self, manager: &str, status: u16, duration_secs: f64) {
        let attrs = [
            KeyValue::new("manager", manager.to_string()),
            KeyValue::new("status", status as i64),
        ];
        self.requests_total.add(1, &attrs);
        self.request_duration.record(duration_secs, &attrs[..1]);
    }

    pub fn record_cache_hit(&self, repository: &str) {
        self.cache_hits_total.add(1, &[repo_attr(repository)]);
    }

    pub fn record_cache_miss(&self, repository: &str) {
        self.cache_misses_total.add(1, &[repo_attr(repository)]);
    }

    pub fn record_upstream_fetch(&self, repository: &str, duration_secs: f64) {
        self.upstream_fetches_total.add(1, &[repo_attr(repository)]);
        self.upstream_duration
            .record(duration_secs, &[repo_attr(repository)]);
    }

    pub fn record_stale_serve(&self, repository: &str) {
        self.stale_serves_total.add(1, &[repo_attr(repository)]);
    }

    pub fn record_coalesced(&self, repository: &str) {
        self.coalesced_waits_total.add(1, &[repo_attr(repository)]);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions_total.add(count, &[]);
    }
}

fn repo_attr(repository: &str) -> KeyValue {
    KeyValue::new("repository", repository.to_string())
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the configured level. The fmt layer is JSON unless
/// `logging.format` is `pretty`.
pub fn init_tracing(otel: &OtelProvider, logging: &LoggingConfig) -> Result<(), OtelError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| OtelError::Config(format!("invalid log level: {}", e)))?;

    let fmt_layer = if logging.format.eq_ignore_ascii_case("pretty") {
        tracing_subscriber::fmt::layer().pretty().boxed()
    } else {
        tracing_subscriber::fmt::layer().json().boxed()
    };

    let otel_layer = otel
        .is_enabled()
        .then(|| tracing_opentelemetry::layer().with_tracer(otel.tracer("artifact-depot")));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| OtelError::TracerInit(e.to_string()))
}
