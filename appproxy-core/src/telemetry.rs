//! OpenTelemetry tracing setup shared by the coordinator and worker
//! binaries. Spans are enriched with `worker_authority` / `circuit_id`
//! instead of claim-derived baggage, since neither process has an
//! end-user identity concept of its own — admission decisions are made
//! against circuit/token records, not bearer-token claims.

use std::borrow::Cow;
use std::sync::OnceLock;

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::SpanBuilder;
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::{ExporterBuildError, SpanExporter, WithExportConfig};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
	pub tracer: Tracer,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum Tracer {
	#[serde(rename = "otlp")]
	Otlp { endpoint: Option<String> },
}

fn get_resource(service_name: &'static str) -> Resource {
	Resource::builder().with_service_name(service_name).build()
}

pub fn get_tracer() -> &'static BoxedTracer {
	static TRACER: OnceLock<BoxedTracer> = OnceLock::new();
	TRACER.get_or_init(|| global::tracer("appproxy"))
}

pub fn start_span(span_name: impl Into<Cow<'static, str>>, attrs: Vec<KeyValue>) -> SpanBuilder {
	use opentelemetry::trace::Tracer as _;
	get_tracer().span_builder(span_name).with_attributes(attrs)
}

/// Tags a span with the circuit/worker identity the current operation is
/// acting on, mirroring how admission/provisioning log lines carry the
/// same fields via `tracing::warn!(circuit_id = %id, ...)`.
pub fn identity_attrs(worker_authority: Option<&str>, circuit_id: Option<&str>) -> Vec<KeyValue> {
	let mut attrs = Vec::new();
	if let Some(authority) = worker_authority {
		attrs.push(KeyValue::new("worker_authority", authority.to_string()));
	}
	if let Some(id) = circuit_id {
		attrs.push(KeyValue::new("circuit_id", id.to_string()));
	}
	attrs
}

pub fn init_tracer(
	service_name: &'static str,
	config: TelemetryConfig,
) -> Result<SdkTracerProvider, ExporterBuildError> {
	global::set_text_map_propagator(TraceContextPropagator::new());

	info!(cfg=?config, "initializing tracer");
	let builder = SpanExporter::builder().with_http();
	let exporter = match config.tracer {
		Tracer::Otlp { endpoint } => match endpoint {
			Some(endpoint) => builder.with_endpoint(endpoint).build()?,
			None => builder.build()?,
		},
	};

	let provider = SdkTracerProvider::builder()
		.with_resource(get_resource(service_name))
		.with_batch_exporter(exporter)
		.build();

	global::set_tracer_provider(provider.clone());
	Ok(provider)
}

/// Injects the current OTel context into an outbound request's headers,
/// used for the coordinator→worker provisioning RPC and the worker's
/// periodic last-access report back to the coordinator.
pub fn inject_context(headers: &mut http::HeaderMap, ctx: &Context) {
	use opentelemetry_http::HeaderInjector;
	global::get_text_map_propagator(|propagator| propagator.inject_context(ctx, &mut HeaderInjector(headers)));
}

pub fn extract_context(headers: &http::HeaderMap) -> Context {
	use opentelemetry_http::HeaderExtractor;
	global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}
