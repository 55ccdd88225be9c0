//! Slot Ledger: per-worker bounded set of addressable ingress
//! keys, reserved atomically via the store's CAS primitive.

use std::sync::Arc;

use appproxy_core::model::{FrontendMode, SlotKey, Worker};
use appproxy_store::kv::KvStore;
use appproxy_store::{keys, StoreError};
use rand::distr::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

const WILDCARD_LABEL_LEN: usize = 16;
const WILDCARD_COLLISION_RETRIES: u32 = 20;

#[derive(Debug, thiserror::Error)]
pub enum ReserveError {
	#[error("no slot available")]
	NoSlotAvailable,
	#[error("store error: {0}")]
	Store(#[from] StoreError),
}

pub struct SlotLedger {
	store: Arc<dyn KvStore>,
}

impl SlotLedger {
	pub fn new(store: Arc<dyn KvStore>) -> Self {
		Self { store }
	}

	/// Reserves a slot for `circuit_id` on `worker`. Honors `preferred_key`
	/// if given and free; otherwise picks the lowest free port (port
	/// frontend) or a fresh random subdomain label (wildcard frontend).
	pub async fn reserve(
		&self,
		worker: &Worker,
		preferred_key: Option<&SlotKey>,
		circuit_id: Uuid,
	) -> Result<SlotKey, ReserveError> {
		if let Some(key) = preferred_key {
			if self.try_reserve(worker, key, circuit_id).await? {
				return Ok(key.clone());
			}
			// Preferred key was taken; for the port frontend we treat this
			// as no-slot (the caller asked for a specific port). For the
			// wildcard frontend we fall through to generating a fresh label.
			if matches!(worker.frontend_mode, FrontendMode::Port) {
				return Err(ReserveError::NoSlotAvailable);
			}
		}

		match worker.frontend_mode {
			FrontendMode::Port => {
				let range = worker.port_range.as_deref().unwrap_or(&[]);
				let mut sorted: Vec<u16> = range.to_vec();
				sorted.sort_unstable();
				for port in sorted {
					let key = SlotKey::Port(port);
					if self.try_reserve(worker, &key, circuit_id).await? {
						return Ok(key);
					}
				}
				Err(ReserveError::NoSlotAvailable)
			},
			FrontendMode::Wildcard => {
				for _ in 0..WILDCARD_COLLISION_RETRIES {
					let label = random_label();
					let key = SlotKey::Subdomain(label.into());
					if self.try_reserve(worker, &key, circuit_id).await? {
						return Ok(key);
					}
				}
				Err(ReserveError::NoSlotAvailable)
			},
		}
	}

	async fn try_reserve(
		&self,
		worker: &Worker,
		key: &SlotKey,
		circuit_id: Uuid,
	) -> Result<bool, StoreError> {
		let store_key = keys::slot(&worker.authority, &key.to_string());
		self.store.create_if_absent(&store_key, circuit_id.to_string().into_bytes(), None).await
	}

	pub async fn release(&self, authority: &str, key: &SlotKey) -> Result<(), StoreError> {
		self.store.delete(&keys::slot(authority, &key.to_string())).await
	}

	/// Returns how many slots are currently bound on `worker`.
	pub async fn occupied_count(&self, authority: &str) -> Result<usize, StoreError> {
		Ok(self.store.list_prefix(&keys::slots_prefix(authority)).await?.len())
	}

	pub async fn has_free_slot(&self, worker: &Worker) -> Result<bool, StoreError> {
		match worker.total_slots() {
			None => Ok(true),
			Some(total) => Ok(self.occupied_count(&worker.authority).await? < total),
		}
	}

	/// True iff `key` is currently free on `worker`. Used by the Worker
	/// Selector's preferred-port/subdomain eligibility check.
	pub async fn is_free(&self, authority: &str, key: &SlotKey) -> Result<bool, StoreError> {
		Ok(self.store.get(&keys::slot(authority, &key.to_string())).await?.is_none())
	}
}

fn random_label() -> String {
	let rng = rand::rng();
	rng
		.sample_iter(&Alphanumeric)
		.map(|b| (b as char).to_ascii_lowercase())
		.filter(char::is_ascii_lowercase)
		.take(WILDCARD_LABEL_LEN)
		.collect()
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use super::*;
	use appproxy_core::model::{Protocol, TrafficClass};
	use appproxy_store::memory::MemoryStore;
	use chrono::Utc;

	fn port_worker() -> Worker {
		Worker {
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

	#[tokio::test]
	async fn reserve_picks_lowest_free_port() {
		let ledger = SlotLedger::new(Arc::new(MemoryStore::new()));
		let worker = port_worker();
		let key = ledger.reserve(&worker, None, Uuid::new_v4()).await.unwrap();
		assert_eq!(key, SlotKey::Port(10205));
		let key2 = ledger.reserve(&worker, None, Uuid::new_v4()).await.unwrap();
		assert_eq!(key2, SlotKey::Port(10206));
	}

	#[tokio::test]
	async fn reserve_fails_when_exhausted() {
		let ledger = SlotLedger::new(Arc::new(MemoryStore::new()));
		let worker = port_worker();
		ledger.reserve(&worker, None, Uuid::new_v4()).await.unwrap();
		ledger.reserve(&worker, None, Uuid::new_v4()).await.unwrap();
		let err = ledger.reserve(&worker, None, Uuid::new_v4()).await.unwrap_err();
		assert!(matches!(err, ReserveError::NoSlotAvailable));
	}

	#[tokio::test]
	async fn release_frees_the_slot_for_reuse() {
		let ledger = SlotLedger::new(Arc::new(MemoryStore::new()));
		let worker = port_worker();
		let key = ledger.reserve(&worker, None, Uuid::new_v4()).await.unwrap();
		ledger.release(&worker.authority, &key).await.unwrap();
		let key2 = ledger.reserve(&worker, None, Uuid::new_v4()).await.unwrap();
		assert_eq!(key, key2);
	}
}
