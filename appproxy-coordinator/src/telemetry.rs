use appproxy_core::metrics::sub_registry;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CircuitLabels {
	pub app_mode: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WorkerLabels {
	pub authority: String,
}

pub struct Metrics {
	pub circuits_created: Family<CircuitLabels, Counter>,
	pub circuits_removed: Family<CircuitLabels, Counter>,
	pub circuits_reused: Counter,
	pub no_slot_available: Counter,
	pub no_worker_available: Counter,
	pub occupied_slots: Family<WorkerLabels, Gauge>,
	pub endpoints_swept: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let registry = sub_registry(registry, "appproxy_coordinator");
		let circuits_created = Family::default();
		registry.register("circuits_created", "circuits created, by app_mode", circuits_created.clone());
		let circuits_removed = Family::default();
		registry.register("circuits_removed", "circuits removed, by app_mode", circuits_removed.clone());
		let circuits_reused = Counter::default();
		registry.register("circuits_reused", "interactive circuit reuse hits", circuits_reused.clone());
		let no_slot_available = Counter::default();
		registry.register("no_slot_available", "slot reservation failures", no_slot_available.clone());
		let no_worker_available = Counter::default();
		registry.register("no_worker_available", "worker selection failures", no_worker_available.clone());
		let occupied_slots = Family::default();
		registry.register("occupied_slots", "occupied slots per worker", occupied_slots.clone());
		let endpoints_swept = Counter::default();
		registry.register("endpoints_swept", "inference circuits evicted by the idle sweeper", endpoints_swept.clone());
		Self {
			circuits_created,
			circuits_removed,
			circuits_reused,
			no_slot_available,
			no_worker_available,
			occupied_slots,
			endpoints_swept,
		}
	}
}
