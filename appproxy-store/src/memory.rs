//! An in-process store used by coordinator/worker integration tests
//! and by single-node development setups. Mirrors the shape of the
//! real KV store closely enough that
//! tests exercising the Slot Ledger / Circuit Registry / Token Vault
//! against this implementation also validate the production code paths
//! built on [`crate::kv::KvStore`].

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::error::StoreError;
use crate::kv::{EventBus, EventStream, KvStore, WatchEvent, WatchStream};
use appproxy_core::model::Event;

struct Entry {
	value: Vec<u8>,
	expires_at: Option<Instant>,
}

struct Inner {
	data: BTreeMap<String, Entry>,
}

pub struct MemoryStore {
	inner: Mutex<Inner>,
	watch_tx: broadcast::Sender<WatchEvent>,
	event_tx: broadcast::Sender<Event>,
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryStore {
	pub fn new() -> Self {
		let (watch_tx, _) = broadcast::channel(256);
		let (event_tx, _) = broadcast::channel(256);
		Self { inner: Mutex::new(Inner { data: BTreeMap::new() }), watch_tx, event_tx }
	}

	fn is_live(entry: &Entry) -> bool {
		entry.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
	}
}

#[async_trait]
impl KvStore for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		let mut inner = self.inner.lock();
		match inner.data.get(key) {
			Some(entry) if Self::is_live(entry) => Ok(Some(entry.value.clone())),
			Some(_) => {
				inner.data.remove(key);
				Ok(None)
			},
			None => Ok(None),
		}
	}

	async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
		self.inner.lock().data.insert(key.to_string(), Entry { value: value.clone(), expires_at: None });
		let _ = self.watch_tx.send(WatchEvent::Put { key: key.to_string(), value });
		Ok(())
	}

	async fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
		let expires_at = Some(Instant::now() + ttl);
		self
			.inner
			.lock()
			.data
			.insert(key.to_string(), Entry { value: value.clone(), expires_at });
		let _ = self.watch_tx.send(WatchEvent::Put { key: key.to_string(), value });
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StoreError> {
		self.inner.lock().data.remove(key);
		let _ = self.watch_tx.send(WatchEvent::Delete { key: key.to_string() });
		Ok(())
	}

	async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
		let mut inner = self.inner.lock();
		let expired: Vec<String> = inner
			.data
			.range(prefix.to_string()..)
			.take_while(|(k, _)| k.starts_with(prefix))
			.filter(|(_, e)| !Self::is_live(e))
			.map(|(k, _)| k.clone())
			.collect();
		for k in expired {
			inner.data.remove(&k);
		}
		Ok(
			inner
				.data
				.range(prefix.to_string()..)
				.take_while(|(k, _)| k.starts_with(prefix))
				.map(|(k, e)| (k.clone(), e.value.clone()))
				.collect(),
		)
	}

	async fn create_if_absent(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock();
		if let Some(existing) = inner.data.get(key) {
			if Self::is_live(existing) {
				return Ok(false);
			}
		}
		let expires_at = ttl.map(|d| Instant::now() + d);
		inner.data.insert(key.to_string(), Entry { value: value.clone(), expires_at });
		drop(inner);
		let _ = self.watch_tx.send(WatchEvent::Put { key: key.to_string(), value });
		Ok(true)
	}

	async fn cas_delete(&self, key: &str, expect: &[u8]) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock();
		let matches = matches!(inner.data.get(key), Some(e) if e.value == expect);
		if matches {
			inner.data.remove(key);
		}
		drop(inner);
		if matches {
			let _ = self.watch_tx.send(WatchEvent::Delete { key: key.to_string() });
		}
		Ok(matches)
	}

	async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError> {
		let prefix = prefix.to_string();
		let stream = BroadcastStream::new(self.watch_tx.subscribe()).filter_map(move |res| {
			let prefix = prefix.clone();
			async move {
				match res {
					Ok(ev) => {
						let key = match &ev {
							WatchEvent::Put { key, .. } => key,
							WatchEvent::Delete { key } => key,
						};
						if key.starts_with(&prefix) {
							Some(Ok(ev))
						} else {
							None
						}
					},
					Err(BroadcastStreamRecvError::Lagged(n)) => {
						Some(Err(StoreError::Backend(format!("watch lagged by {n} events"))))
					},
				}
			}
		});
		Ok(Box::pin(stream))
	}
}

#[async_trait]
impl EventBus for MemoryStore {
	async fn publish(&self, event: Event) -> Result<(), StoreError> {
		// Ok to have no subscribers.
		let _ = self.event_tx.send(event);
		Ok(())
	}

	async fn subscribe(&self) -> Result<EventStream<Event>, StoreError> {
		let stream = BroadcastStream::new(self.event_tx.subscribe()).map(|res| {
			res.map_err(|BroadcastStreamRecvError::Lagged(n)| {
				StoreError::Backend(format!("event bus lagged by {n} events"))
			})
		});
		Ok(Box::pin(stream))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn create_if_absent_is_exclusive() {
		let store = MemoryStore::new();
		assert!(store.create_if_absent("k", b"a".to_vec(), None).await.unwrap());
		assert!(!store.create_if_absent("k", b"b".to_vec(), None).await.unwrap());
		assert_eq!(store.get("k").await.unwrap(), Some(b"a".to_vec()));
	}

	#[tokio::test]
	async fn cas_delete_requires_matching_value() {
		let store = MemoryStore::new();
		store.put("k", b"a".to_vec()).await.unwrap();
		assert!(!store.cas_delete("k", b"b").await.unwrap());
		assert!(store.cas_delete("k", b"a").await.unwrap());
		assert_eq!(store.get("k").await.unwrap(), None);
	}

	#[tokio::test]
	async fn ttl_expiry_is_observed_on_get() {
		let store = MemoryStore::new();
		store.put_with_ttl("k", b"a".to_vec(), Duration::from_millis(10)).await.unwrap();
		assert_eq!(store.get("k").await.unwrap(), Some(b"a".to_vec()));
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert_eq!(store.get("k").await.unwrap(), None);
	}

	#[tokio::test]
	async fn list_prefix_scopes_to_prefix() {
		let store = MemoryStore::new();
		store.put("a/1", b"x".to_vec()).await.unwrap();
		store.put("a/2", b"y".to_vec()).await.unwrap();
		store.put("b/1", b"z".to_vec()).await.unwrap();
		let listed = store.list_prefix("a/").await.unwrap();
		assert_eq!(listed.len(), 2);
	}
}
