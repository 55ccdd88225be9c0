//! Worker Selector: picks a worker whose capabilities match
//! an incoming request, respecting remaining-slot counts and app-filter
//! restrictions, with a deterministic tie-break order.

use std::sync::Arc;

use appproxy_core::model::{FrontendMode, Protocol, SlotKey, TrafficClass, Worker};
use appproxy_store::kv::KvStore;
use appproxy_store::{keys, typed, StoreError};

use crate::slot_ledger::SlotLedger;
use crate::telemetry::{Metrics, WorkerLabels};

pub struct SelectionRequest<'a> {
	pub traffic_class: TrafficClass,
	pub frontend_mode: FrontendMode,
	pub protocol: Protocol,
	pub app: Option<&'a str>,
	pub preferred_key: Option<&'a SlotKey>,
}

pub struct WorkerSelector {
	store: Arc<dyn KvStore>,
	slot_ledger: Arc<SlotLedger>,
	metrics: Arc<Metrics>,
}

impl WorkerSelector {
	pub fn new(store: Arc<dyn KvStore>, slot_ledger: Arc<SlotLedger>, metrics: Arc<Metrics>) -> Self {
		Self { store, slot_ledger, metrics }
	}

	pub async fn select(&self, request: &SelectionRequest<'_>) -> Result<Option<Worker>, StoreError> {
		let rows = typed::list_typed::<Worker>(self.store.as_ref(), &keys::workers_prefix()).await?;

		let mut candidates = Vec::new();
		for (_, worker) in rows {
			if !self.eligible(&worker, request).await? {
				continue;
			}
			let matches_filter = matches_app_filter(&worker, request.app);
			let free = self.slot_ledger.occupied_count(&worker.authority).await?;
			self.metrics.occupied_slots.get_or_create(&WorkerLabels { authority: worker.authority.to_string() }).set(free as i64);
			let free_slots = worker.total_slots().map(|total| total.saturating_sub(free));
			candidates.push((worker, matches_filter, free_slots));
		}

		candidates.sort_by(|a, b| {
			// (1) app-filter match ranks first, (2) more free slots first
			// (unbounded wildcard workers always outrank bounded ones),
			// (3) lexicographic authority as a stable tie-break.
			b.1.cmp(&a.1).then_with(|| match (a.2, b.2) {
				(None, None) => std::cmp::Ordering::Equal,
				(None, Some(_)) => std::cmp::Ordering::Less,
				(Some(_), None) => std::cmp::Ordering::Greater,
				(Some(x), Some(y)) => y.cmp(&x),
			}).then_with(|| a.0.authority.cmp(&b.0.authority))
		});

		let picked = candidates.into_iter().next().map(|(w, _, _)| w);
		if picked.is_none() {
			self.metrics.no_worker_available.inc();
		}
		Ok(picked)
	}

	async fn eligible(&self, worker: &Worker, request: &SelectionRequest<'_>) -> Result<bool, StoreError> {
		if !worker.accepts(request.traffic_class) {
			return Ok(false);
		}
		if worker.frontend_mode != request.frontend_mode {
			return Ok(false);
		}
		if worker.protocol != request.protocol {
			return Ok(false);
		}
		if worker.filtered_apps_only && !matches_app_filter(worker, request.app) {
			return Ok(false);
		}
		if let Some(key) = request.preferred_key {
			if !key_belongs_to_worker(worker, key) {
				return Ok(false);
			}
			return self.slot_ledger.is_free(&worker.authority, key).await;
		}
		self.slot_ledger.has_free_slot(worker).await
	}
}

fn matches_app_filter(worker: &Worker, app: Option<&str>) -> bool {
	let Some(app) = app else { return false };
	worker.app_filters.iter().any(|f| f.key == "app" && f.value == app)
}

fn key_belongs_to_worker(worker: &Worker, key: &SlotKey) -> bool {
	match (worker.frontend_mode, key) {
		(FrontendMode::Port, SlotKey::Port(p)) => {
			worker.port_range.as_ref().is_some_and(|r| r.contains(p))
		},
		(FrontendMode::Wildcard, SlotKey::Subdomain(_)) => true,
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use super::*;
	use appproxy_core::model::AppFilter;
	use appproxy_store::memory::MemoryStore;
	use chrono::Utc;
	use uuid::Uuid;

	fn worker(authority: &str, filtered: bool, filters: Vec<AppFilter>) -> Worker {
		Worker {
			id: Uuid::new_v4(),
			authority: authority.into(),
			frontend_mode: FrontendMode::Port,
			protocol: Protocol::Http,
			hostname: format!("{authority}.internal").into(),
			use_tls: false,
			api_port: 6065,
			port_range: Some(vec![10205, 10206]),
			wildcard_domain: None,
			filtered_apps_only: filtered,
			accepted_traffics: vec![TrafficClass::Interactive],
			app_filters: filters,
			created_at: Utc::now(),
			updated_at: Utc::now(),
			node_ids: BTreeSet::from([Uuid::new_v4()]),
		}
	}

	#[tokio::test]
	async fn app_filter_match_outranks_generic_worker() {
		let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
		let ledger = Arc::new(SlotLedger::new(store.clone()));
		let generic = worker("a-generic", false, vec![]);
		let filtered = worker(
			"b-filtered",
			true,
			vec![AppFilter { key: "app".into(), value: "jupyter".into() }],
		);
		typed::put_typed(store.as_ref(), &keys::worker("a-generic"), &generic).await.unwrap();
		typed::put_typed(store.as_ref(), &keys::worker("b-filtered"), &filtered).await.unwrap();

		let metrics = Arc::new(Metrics::new(&mut prometheus_client::registry::Registry::default()));
		let selector = WorkerSelector::new(store, ledger, metrics);
		let req = SelectionRequest {
			traffic_class: TrafficClass::Interactive,
			frontend_mode: FrontendMode::Port,
			protocol: Protocol::Http,
			app: Some("jupyter"),
			preferred_key: None,
		};
		let picked = selector.select(&req).await.unwrap().unwrap();
		assert_eq!(picked.authority.as_str(), "b-filtered");
	}

	#[tokio::test]
	async fn filtered_apps_only_worker_rejects_non_matching_app() {
		let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
		let ledger = Arc::new(SlotLedger::new(store.clone()));
		let filtered = worker(
			"only-jupyter",
			true,
			vec![AppFilter { key: "app".into(), value: "jupyter".into() }],
		);
		typed::put_typed(store.as_ref(), &keys::worker("only-jupyter"), &filtered).await.unwrap();

		let metrics = Arc::new(Metrics::new(&mut prometheus_client::registry::Registry::default()));
		let selector = WorkerSelector::new(store, ledger, metrics);
		let req = SelectionRequest {
			traffic_class: TrafficClass::Interactive,
			frontend_mode: FrontendMode::Port,
			protocol: Protocol::Http,
			app: Some("tensorboard"),
			preferred_key: None,
		};
		assert!(selector.select(&req).await.unwrap().is_none());
	}
}
