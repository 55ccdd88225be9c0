//! In-process circuit table: the worker's view of which slots are
//! currently bound, kept converged with the coordinator via the event
//! stream and the registration-time reconciliation fetch.
//! Guarded by a single [`tokio::sync::RwLock`] over both indices, since
//! they're always updated together.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use appproxy_core::model::{AppMode, Circuit, SlotKey};
use appproxy_store::kv::KvStore;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;
use crate::coordinator_client::CoordinatorClient;
use crate::pool::BackendPool;
use crate::telemetry::Metrics;

#[derive(Default)]
struct Inner {
	by_key: HashMap<SlotKey, Circuit>,
	by_id: HashMap<Uuid, SlotKey>,
	/// Inference circuit ids touched since the last flush pass.
	dirty_last_access: HashSet<Uuid>,
}

pub struct CircuitTable {
	inner: RwLock<Inner>,
}

impl Default for CircuitTable {
	fn default() -> Self {
		Self::new()
	}
}

impl CircuitTable {
	pub fn new() -> Self {
		Self { inner: RwLock::new(Inner::default()) }
	}

	/// Installs (or replaces) a circuit's frontend binding. Idempotent:
	/// re-installing the same circuit id on the same key is a no-op from
	/// the caller's perspective, which is what lets the worker converge
	/// correctly whether it learns of a circuit via the provisioning RPC,
	/// the event stream, or the startup reconciliation fetch.
	pub async fn install(&self, circuit: Circuit) {
		let key = circuit.slot_key();
		let mut inner = self.inner.write().await;
		if let Some(old_key) = inner.by_id.insert(circuit.id, key.clone()) {
			if old_key != key {
				inner.by_key.remove(&old_key);
			}
		}
		inner.by_key.insert(key, circuit);
	}

	pub async fn uninstall(&self, circuit_id: Uuid) -> Option<Circuit> {
		let mut inner = self.inner.write().await;
		let key = inner.by_id.remove(&circuit_id)?;
		inner.dirty_last_access.remove(&circuit_id);
		inner.by_key.remove(&key)
	}

	pub async fn get_by_key(&self, key: &SlotKey) -> Option<Circuit> {
		self.inner.read().await.by_key.get(key).cloned()
	}

	pub async fn get_by_id(&self, id: Uuid) -> Option<Circuit> {
		let inner = self.inner.read().await;
		let key = inner.by_id.get(&id)?;
		inner.by_key.get(key).cloned()
	}

	/// Records a successful handoff, marking the circuit dirty for the
	/// next last-access flush pass. No-op for interactive circuits,
	/// which have no idle-eviction TTL.
	pub async fn mark_accessed(&self, circuit_id: Uuid) {
		let mut inner = self.inner.write().await;
		if let Some(key) = inner.by_id.get(&circuit_id) {
			if let Some(circuit) = inner.by_key.get(key) {
				if circuit.app_mode == AppMode::Inference {
					inner.dirty_last_access.insert(circuit_id);
				}
			}
		}
	}

	pub async fn drain_dirty(&self) -> Vec<Uuid> {
		let mut inner = self.inner.write().await;
		inner.dirty_last_access.drain().collect()
	}

	pub async fn snapshot(&self) -> Vec<Circuit> {
		self.inner.read().await.by_key.values().cloned().collect()
	}
}

#[derive(Clone)]
pub struct AppState {
	pub config: Arc<Config>,
	pub table: Arc<CircuitTable>,
	pub pool: Arc<BackendPool>,
	pub coordinator: Arc<CoordinatorClient>,
	pub metrics: Arc<Metrics>,
	/// Direct store handle for local `ApiToken` verification.
	pub store: Arc<dyn KvStore>,
}

impl AppState {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: Arc<Config>,
		table: Arc<CircuitTable>,
		pool: Arc<BackendPool>,
		coordinator: Arc<CoordinatorClient>,
		metrics: Arc<Metrics>,
		store: Arc<dyn KvStore>,
	) -> Self {
		Self { config, table, pool, coordinator, metrics, store }
	}
}
