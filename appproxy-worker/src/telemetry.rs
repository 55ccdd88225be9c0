use appproxy_core::metrics::sub_registry;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AdmissionLabels {
	pub code: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
	pub session_id: String,
}

pub struct Metrics {
	pub circuits_installed: Counter,
	pub circuits_uninstalled: Counter,
	pub admission_rejected: Family<AdmissionLabels, Counter>,
	pub backend_connect_failed: Counter,
	pub inference_route_selected: Family<RouteLabels, Counter>,
	pub pooled_connections: Gauge,
	pub last_access_flush_failed: Counter,
	pub event_errors: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let registry = sub_registry(registry, "appproxy_worker");
		let circuits_installed = Counter::default();
		registry.register("circuits_installed", "frontend handlers installed", circuits_installed.clone());
		let circuits_uninstalled = Counter::default();
		registry.register("circuits_uninstalled", "frontend handlers uninstalled", circuits_uninstalled.clone());
		let admission_rejected = Family::default();
		registry.register("admission_rejected", "connections rejected by the admission pipeline, by error code", admission_rejected.clone());
		let backend_connect_failed = Counter::default();
		registry.register("backend_connect_failed", "failed backend dial attempts", backend_connect_failed.clone());
		let inference_route_selected = Family::default();
		registry.register("inference_route_selected", "inference requests routed, by session_id", inference_route_selected.clone());
		let pooled_connections = Gauge::default();
		registry.register("pooled_connections", "backend connections currently checked into the pool", pooled_connections.clone());
		let last_access_flush_failed = Counter::default();
		registry.register("last_access_flush_failed", "failed last-access flush RPCs to the coordinator", last_access_flush_failed.clone());
		let event_errors = Counter::default();
		registry.register("event_errors", "errors surfaced on the coordinator/events subscription", event_errors.clone());
		Self {
			circuits_installed,
			circuits_uninstalled,
			admission_rejected,
			backend_connect_failed,
			inference_route_selected,
			pooled_connections,
			last_access_flush_failed,
			event_errors,
		}
	}
}
