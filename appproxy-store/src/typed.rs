//! Thin typed layer over [`KvStore`]: every domain struct in
//! `appproxy_core::model` is stored as its canonical JSON encoding, so
//! these helpers are the only place (de)serialization happens.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::kv::KvStore;

pub async fn get_typed<T: DeserializeOwned>(
	store: &dyn KvStore,
	key: &str,
) -> Result<Option<T>, StoreError> {
	match store.get(key).await? {
		Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
		None => Ok(None),
	}
}

pub async fn put_typed<T: Serialize + Sync>(
	store: &dyn KvStore,
	key: &str,
	value: &T,
) -> Result<(), StoreError> {
	let bytes = serde_json::to_vec(value)?;
	store.put(key, bytes).await
}

pub async fn put_typed_with_ttl<T: Serialize + Sync>(
	store: &dyn KvStore,
	key: &str,
	value: &T,
	ttl: Duration,
) -> Result<(), StoreError> {
	let bytes = serde_json::to_vec(value)?;
	store.put_with_ttl(key, bytes, ttl).await
}

/// Creates `key` iff absent, returning `true` on success.
pub async fn create_typed_if_absent<T: Serialize + Sync>(
	store: &dyn KvStore,
	key: &str,
	value: &T,
	ttl: Option<Duration>,
) -> Result<bool, StoreError> {
	let bytes = serde_json::to_vec(value)?;
	store.create_if_absent(key, bytes, ttl).await
}

pub async fn list_typed<T: DeserializeOwned>(
	store: &dyn KvStore,
	prefix: &str,
) -> Result<Vec<(String, T)>, StoreError> {
	let raw = store.list_prefix(prefix).await?;
	raw.into_iter()
		.map(|(k, v)| Ok((k, serde_json::from_slice(&v)?)))
		.collect()
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use super::*;
	use crate::memory::MemoryStore;
	use appproxy_core::model::{FrontendMode, Protocol, TrafficClass, Worker};
	use chrono::Utc;
	use uuid::Uuid;

	fn sample_worker() -> Worker {
		Worker {
			id: Uuid::new_v4(),
			authority: "w1".into(),
			frontend_mode: FrontendMode::Port,
			protocol: Protocol::Http,
			hostname: "w1.internal".into(),
			use_tls: false,
			api_port: 6065,
			port_range: Some(vec![30000, 30001]),
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
	async fn round_trips_through_json() {
		let store = MemoryStore::new();
		let w = sample_worker();
		put_typed(&store, "k", &w).await.unwrap();
		let back: Worker = get_typed(&store, "k").await.unwrap().unwrap();
		assert_eq!(back.authority, w.authority);
		assert_eq!(back.port_range, w.port_range);
	}

	#[tokio::test]
	async fn list_typed_decodes_every_match() {
		let store = MemoryStore::new();
		put_typed(&store, "w/1", &sample_worker()).await.unwrap();
		put_typed(&store, "w/2", &sample_worker()).await.unwrap();
		let all: Vec<(String, Worker)> = list_typed(&store, "w/").await.unwrap();
		assert_eq!(all.len(), 2);
	}
}
