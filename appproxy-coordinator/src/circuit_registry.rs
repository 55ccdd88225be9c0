//! Circuit Registry: creation, lookup, removal of Circuit
//! records, with at-most-one-concurrent-creation-per-fingerprint
//! coalescing via an in-store advisory lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use appproxy_core::model::{Circuit, Event};
use appproxy_store::kv::{EventBus, KvStore};
use appproxy_store::{keys, typed, StoreError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::slot_ledger::{ReserveError, SlotLedger};
use crate::telemetry::{CircuitLabels, Metrics};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("no slot available")]
	NoSlotAvailable,
	#[error("store error: {0}")]
	Store(#[from] StoreError),
	#[error("circuit not found")]
	NotFound,
	#[error("timed out waiting for concurrent creation to finish")]
	CreationTimedOut,
}

impl From<ReserveError> for RegistryError {
	fn from(value: ReserveError) -> Self {
		match value {
			ReserveError::NoSlotAvailable => RegistryError::NoSlotAvailable,
			ReserveError::Store(e) => RegistryError::Store(e),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "state")]
enum LockValue {
	Pending,
	Ready { circuit_id: Uuid },
}

pub enum CreateOutcome {
	Created(Circuit),
	Reused(Circuit),
}

/// In-process rendezvous so same-process fingerprint-lock losers don't
/// have to poll the store on a tight interval; cross-process losers still
/// converge correctly via polling alone.
#[derive(Default)]
pub struct FingerprintWaiters {
	senders: HashMap<String, broadcast::Sender<LockValue>>,
}

impl FingerprintWaiters {
	fn get_or_create(&mut self, digest: &str) -> broadcast::Sender<LockValue> {
		self.senders.entry(digest.to_string()).or_insert_with(|| broadcast::channel(16).0).clone()
	}

	fn notify(&mut self, digest: &str, value: LockValue) {
		if let Some(tx) = self.senders.remove(digest) {
			let _ = tx.send(value);
		}
	}
}

pub struct CircuitRegistry {
	store: Arc<dyn KvStore>,
	bus: Arc<dyn EventBus>,
	slot_ledger: Arc<SlotLedger>,
	waiters: Arc<RwLock<FingerprintWaiters>>,
	reuse_wait: Duration,
	metrics: Arc<Metrics>,
}

impl CircuitRegistry {
	pub fn new(
		store: Arc<dyn KvStore>,
		bus: Arc<dyn EventBus>,
		slot_ledger: Arc<SlotLedger>,
		waiters: Arc<RwLock<FingerprintWaiters>>,
		reuse_wait: Duration,
		metrics: Arc<Metrics>,
	) -> Self {
		Self { store, bus, slot_ledger, waiters, reuse_wait, metrics }
	}

	fn app_mode_label(circuit: &Circuit) -> CircuitLabels {
		CircuitLabels {
			app_mode: match circuit.app_mode {
				appproxy_core::model::AppMode::Interactive => "interactive",
				appproxy_core::model::AppMode::Inference => "inference",
			},
		}
	}

	pub async fn get(&self, id: Uuid) -> Result<Option<Circuit>, StoreError> {
		typed::get_typed(self.store.as_ref(), &keys::circuit(&id.to_string())).await
	}

	pub async fn find_reusable(&self, fingerprint_digest: &str) -> Result<Option<Circuit>, StoreError> {
		let lock_key = keys::fingerprint_lock(fingerprint_digest);
		match typed::get_typed::<LockValue>(self.store.as_ref(), &lock_key).await? {
			Some(LockValue::Ready { circuit_id }) => self.get(circuit_id).await,
			_ => Ok(None),
		}
	}

	/// Creates a new circuit for `build`, or reuses a live circuit matching
	/// `fingerprint_digest` if one exists or is concurrently being created
	/// by another caller: concurrent identical-fingerprint requests
	/// converge to exactly one circuit.
	pub async fn create_or_reuse(
		&self,
		fingerprint_digest: Option<&str>,
		mut build: impl FnMut() -> Circuit + Send,
		worker: &appproxy_core::model::Worker,
	) -> Result<CreateOutcome, RegistryError> {
		let Some(digest) = fingerprint_digest else {
			let circuit = self.create_unlocked(build(), worker).await.inspect_err(|err| {
				if matches!(err, RegistryError::NoSlotAvailable) {
					self.metrics.no_slot_available.inc();
				}
			})?;
			self.metrics.circuits_created.get_or_create(&Self::app_mode_label(&circuit)).inc();
			return Ok(CreateOutcome::Created(circuit));
		};

		let lock_key = keys::fingerprint_lock(digest);
		const MAX_ATTEMPTS: u32 = 5;
		for _ in 0..MAX_ATTEMPTS {
			let won =
				typed::create_typed_if_absent(self.store.as_ref(), &lock_key, &LockValue::Pending, None).await?;
			if won {
				let rx = self.waiters.write().await.get_or_create(digest).subscribe();
				drop(rx);
				match self.create_unlocked(build(), worker).await {
					Ok(circuit) => {
						let ready = LockValue::Ready { circuit_id: circuit.id };
						typed::put_typed(self.store.as_ref(), &lock_key, &ready).await?;
						typed::put_typed(
							self.store.as_ref(),
							&keys::fingerprint_by_circuit(&circuit.id.to_string()),
							&digest.to_string(),
						)
						.await?;
						self.waiters.write().await.notify(digest, ready);
						self.metrics.circuits_created.get_or_create(&Self::app_mode_label(&circuit)).inc();
						return Ok(CreateOutcome::Created(circuit));
					},
					Err(err) => {
						// Release the lock so the next attempt (ours or
						// another caller's) can retry from scratch.
						let _ = self.store.delete(&lock_key).await;
						self.waiters.write().await.notify(digest, LockValue::Pending);
						return Err(err);
					},
				}
			}

			match typed::get_typed::<LockValue>(self.store.as_ref(), &lock_key).await? {
				Some(LockValue::Ready { circuit_id }) => {
					if let Some(circuit) = self.get(circuit_id).await? {
						self.metrics.circuits_reused.inc();
						return Ok(CreateOutcome::Reused(circuit));
					}
					// Pointer outlived its circuit; clear it and retry.
					let _ = self.store.delete(&lock_key).await;
					continue;
				},
				Some(LockValue::Pending) => {
					let rx = self.waiters.write().await.get_or_create(digest).subscribe();
					self.await_pending(rx).await;
					continue;
				},
				None => continue,
			}
		}
		Err(RegistryError::CreationTimedOut)
	}

	async fn await_pending(&self, mut rx: broadcast::Receiver<LockValue>) {
		let _ = tokio::time::timeout(self.reuse_wait, rx.recv()).await;
	}

	async fn create_unlocked(
		&self,
		mut circuit: Circuit,
		worker: &appproxy_core::model::Worker,
	) -> Result<Circuit, RegistryError> {
		let preferred = circuit.port.map(appproxy_core::model::SlotKey::Port).or_else(|| {
			circuit.subdomain.clone().map(appproxy_core::model::SlotKey::Subdomain)
		});
		let key = self.slot_ledger.reserve(worker, preferred.as_ref(), circuit.id).await?;
		match &key {
			appproxy_core::model::SlotKey::Port(p) => circuit.port = Some(*p),
			appproxy_core::model::SlotKey::Subdomain(s) => circuit.subdomain = Some(s.clone()),
		}
		circuit.created_at = Utc::now();
		circuit.updated_at = circuit.created_at;

		if let Err(err) = self.write_circuit(&circuit).await {
			let _ = self.slot_ledger.release(&worker.authority, &key).await;
			return Err(err.into());
		}

		if let Err(err) = self.bus.publish(Event::CircuitCreated { circuit: circuit.clone() }).await {
			warn!(circuit_id = %circuit.id, error = %err, "failed to publish circuit-created event; relying on watchers to converge from the store");
		}
		Ok(circuit)
	}

	async fn write_circuit(&self, circuit: &Circuit) -> Result<(), StoreError> {
		typed::put_typed(self.store.as_ref(), &keys::circuit(&circuit.id.to_string()), circuit).await?;
		self
			.store
			.put(&keys::circuit_by_worker(&circuit.worker, &circuit.id.to_string()), Vec::new())
			.await
	}

	/// Removes a circuit, releasing its slot exactly once (invariant ii)
	/// and its fingerprint reuse pointer if it has one.
	pub async fn remove(&self, id: Uuid) -> Result<Circuit, RegistryError> {
		let Some(circuit) = self.get(id).await? else {
			return Err(RegistryError::NotFound);
		};

		self.store.delete(&keys::circuit(&id.to_string())).await?;
		self.store.delete(&keys::circuit_by_worker(&circuit.worker, &id.to_string())).await?;
		self.slot_ledger.release(&circuit.worker, &circuit.slot_key()).await?;

		let fp_by_circuit_key = keys::fingerprint_by_circuit(&id.to_string());
		if let Some(digest) = typed::get_typed::<String>(self.store.as_ref(), &fp_by_circuit_key).await? {
			let lock_key = keys::fingerprint_lock(&digest);
			let expect = serde_json::to_vec(&LockValue::Ready { circuit_id: id }).unwrap_or_default();
			let _ = self.store.cas_delete(&lock_key, &expect).await;
			let _ = self.store.delete(&fp_by_circuit_key).await;
		}

		if let Err(err) = self
			.bus
			.publish(Event::CircuitRemoved { circuit_id: id, worker: circuit.worker.clone(), key: circuit.slot_key() })
			.await
		{
			warn!(circuit_id = %id, error = %err, "failed to publish circuit-removed event");
		}
		self.metrics.circuits_removed.get_or_create(&Self::app_mode_label(&circuit)).inc();
		Ok(circuit)
	}

	/// Replaces `route_info` for an existing circuit atomically (invariant
	/// iii): the whole array is swapped in one write, never partially.
	pub async fn update_route_info(
		&self,
		id: Uuid,
		route_info: Vec<appproxy_core::model::RouteInfo>,
	) -> Result<Circuit, RegistryError> {
		let Some(mut circuit) = self.get(id).await? else {
			return Err(RegistryError::NotFound);
		};
		circuit.route_info = route_info;
		circuit.touch();
		self.write_circuit(&circuit).await?;
		if let Err(err) = self.bus.publish(Event::CircuitUpdated { circuit: circuit.clone() }).await {
			warn!(circuit_id = %id, error = %err, "failed to publish circuit-updated event");
		}
		Ok(circuit)
	}

	/// Bumps `updated_at` to record a last-access report from the worker
	///, without touching `route_info`.
	pub async fn touch_last_access(&self, id: Uuid) -> Result<(), RegistryError> {
		let Some(mut circuit) = self.get(id).await? else {
			return Err(RegistryError::NotFound);
		};
		circuit.touch();
		self.write_circuit(&circuit).await?;
		Ok(())
	}

	pub async fn list_by_worker(&self, authority: &str) -> Result<Vec<Circuit>, StoreError> {
		let ids = self.store.list_prefix(&keys::circuits_by_worker_prefix(authority)).await?;
		let mut out = Vec::with_capacity(ids.len());
		for (key, _) in ids {
			let Some(id_str) = key.rsplit('/').next() else { continue };
			let Ok(id) = id_str.parse::<Uuid>() else { continue };
			if let Some(circuit) = self.get(id).await? {
				out.push(circuit);
			}
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use super::*;
	use appproxy_core::model::{AppMode, FrontendMode, Protocol, TrafficClass};
	use appproxy_store::memory::MemoryStore;

	fn worker() -> appproxy_core::model::Worker {
		appproxy_core::model::Worker {
			id: Uuid::new_v4(),
			authority: "w1".into(),
			frontend_mode: FrontendMode::Port,
			protocol: Protocol::Http,
			hostname: "w1.internal".into(),
			use_tls: false,
			api_port: 6065,
			port_range: Some(vec![10205, 10206]),
			wildcard_domain: None,
			filtered_apps_only: false,
			accepted_traffics: vec![TrafficClass::Interactive],
			app_filters: vec![],
			created_at: Utc::now(),
			updated_at: Utc::now(),
			node_ids: BTreeSet::from([Uuid::new_v4()]),
		}
	}

	fn blank_circuit() -> Circuit {
		Circuit {
			id: Uuid::new_v4(),
			app: "jupyter".into(),
			protocol: Protocol::Http,
			worker: "w1".into(),
			app_mode: AppMode::Interactive,
			frontend_mode: FrontendMode::Port,
			envs: Default::default(),
			arguments: None,
			open_to_public: false,
			allowed_client_ips: None,
			port: None,
			subdomain: None,
			user_id: Some(Uuid::new_v4()),
			endpoint_id: None,
			route_info: vec![],
			session_ids: vec![Uuid::new_v4()],
			auth_secret: Some("s3cr3t".into()),
			created_at: Utc::now(),
			updated_at: Utc::now(),
		}
	}

	fn registry() -> CircuitRegistry {
		let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
		let bus: Arc<dyn EventBus> = Arc::new(MemoryStore::new());
		let ledger = Arc::new(SlotLedger::new(store.clone()));
		let metrics = Arc::new(Metrics::new(&mut prometheus_client::registry::Registry::default()));
		CircuitRegistry::new(
			store,
			bus,
			ledger,
			Arc::new(RwLock::new(FingerprintWaiters::default())),
			Duration::from_millis(500),
			metrics,
		)
	}

	#[tokio::test]
	async fn create_reserves_a_slot_and_reuse_finds_it() {
		let registry = registry();
		let w = worker();
		let outcome = registry.create_or_reuse(Some("fp1"), blank_circuit, &w).await.unwrap();
		let CreateOutcome::Created(circuit) = outcome else { panic!("expected created") };
		assert_eq!(circuit.port, Some(10205));

		let reused = registry.find_reusable("fp1").await.unwrap().unwrap();
		assert_eq!(reused.id, circuit.id);
	}

	#[tokio::test]
	async fn concurrent_create_with_same_fingerprint_coalesces() {
		let registry = Arc::new(registry());
		let w = worker();
		let mut handles = Vec::new();
		for _ in 0..10 {
			let registry = registry.clone();
			let w = w.clone();
			handles.push(tokio::spawn(async move {
				match registry.create_or_reuse(Some("fp-race"), blank_circuit, &w).await.unwrap() {
					CreateOutcome::Created(c) => c.id,
					CreateOutcome::Reused(c) => c.id,
				}
			}));
		}
		let mut ids = Vec::new();
		for h in handles {
			ids.push(h.await.unwrap());
		}
		let first = ids[0];
		assert!(ids.iter().all(|id| *id == first));
	}

	#[tokio::test]
	async fn remove_releases_slot_and_clears_fingerprint_pointer() {
		let registry = registry();
		let w = worker();
		let CreateOutcome::Created(circuit) =
			registry.create_or_reuse(Some("fp1"), blank_circuit, &w).await.unwrap()
		else {
			panic!("expected created")
		};
		registry.remove(circuit.id).await.unwrap();
		assert!(registry.find_reusable("fp1").await.unwrap().is_none());

		let w2 = worker();
		let again = registry.create_or_reuse(Some("fp1"), blank_circuit, &w2).await.unwrap();
		let CreateOutcome::Created(second) = again else { panic!("expected new circuit after removal") };
		assert_eq!(second.port, Some(10205));
	}
}
