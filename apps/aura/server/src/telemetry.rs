use anyhow::{anyhow, Context, Result};
use metrics::{KeyName, Recorder, SharedString};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "aura-server";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Counter,
    Gauge,
}

/// Every metric the relay records, with its help text.
const CATALOGUE: &[(MetricKind, &str, &str)] = &[
    (
        MetricKind::Gauge,
        "aura_pool_members",
        "Live connections in each pool.",
    ),
    (
        MetricKind::Counter,
        "aura_connections_total",
        "Connections registered, by pool.",
    ),
    (
        MetricKind::Counter,
        "aura_routes_total",
        "Inbound envelopes routed, by outcome.",
    ),
    (
        MetricKind::Counter,
        "aura_purges_total",
        "Connections dropped after a failed send, by pool.",
    ),
    (
        MetricKind::Counter,
        "aura_stats_broadcast_retries_total",
        "Repeat attempts made while announcing pool sizes.",
    ),
    (
        MetricKind::Counter,
        "aura_auth_failures_total",
        "Websocket upgrades refused by the auth gate, by pool and reason.",
    ),
];

/// Process-wide logging and metrics, plus the span exporter when enabled.
/// Dropping it flushes pending spans.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init(otel_stdout: bool) -> Result<Self> {
        let metrics_handle = install_metrics()?;
        let tracer_provider = otel_stdout.then(stdout_tracer_provider);
        init_tracing(tracer_provider.as_ref())?;
        if tracer_provider.is_some() {
            info!(service = SERVICE_NAME, "exporting spans to stdout");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let Some(provider) = self.tracer_provider.take() else {
            return;
        };
        if let Err(err) = provider.shutdown() {
            warn!(error = %err, "span exporter did not shut down cleanly");
        }
    }
}

fn install_metrics() -> Result<PrometheusHandle> {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    describe_metrics(&recorder);
    metrics::set_boxed_recorder(Box::new(recorder))
        .map_err(|err| anyhow!("failed to install Prometheus recorder: {err}"))?;
    Ok(handle)
}

fn describe_metrics<R: Recorder>(recorder: &R) {
    for &(kind, name, help) in CATALOGUE {
        let key = KeyName::from(name);
        let help = SharedString::from(help);
        match kind {
            MetricKind::Counter => recorder.describe_counter(key, None, help),
            MetricKind::Gauge => recorder.describe_gauge(key, None, help),
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    let resource = Resource::builder()
        .with_attributes([KeyValue::new("service.name", SERVICE_NAME)])
        .build();
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());
    provider
}

fn init_tracing(provider: Option<&SdkTracerProvider>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let spans = provider
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(spans)
        .try_init()
        .context("failed to initialise tracing subscriber")
}
