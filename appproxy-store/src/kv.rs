use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::StoreError;

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, StoreError>> + Send>>;
pub type EventStream<E> = Pin<Box<dyn Stream<Item = Result<E, StoreError>> + Send>>;

#[derive(Clone, Debug)]
pub enum WatchEvent {
	Put { key: String, value: Vec<u8> },
	Delete { key: String },
}

/// Narrow interface onto the shared key-value store. Every method may suspend and may fail transiently; retries
/// with capped backoff are the caller's responsibility.
#[async_trait]
pub trait KvStore: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

	async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

	/// Put with an expiry; used for confirmation tokens (minutes-scale TTL)
	/// and endpoint API tokens (`exp`-scale TTL).
	async fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

	async fn delete(&self, key: &str) -> Result<(), StoreError>;

	async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

	/// Atomically creates `key` with `value` iff it does not already
	/// exist. Returns `true` if this call won the race. Used for slot
	/// reservation CAS and the fingerprint advisory lock.
	async fn create_if_absent(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<bool, StoreError>;

	/// Deletes `key` only if its current value equals `expect`, otherwise
	/// leaves it untouched. Returns whether the delete happened. Used for
	/// consume-on-read token redemption and exactly-once slot
	/// release.
	async fn cas_delete(&self, key: &str, expect: &[u8]) -> Result<bool, StoreError>;

	async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError>;
}

/// The pub/sub side of the store: topic `coordinator/events`,
/// carrying the envelope `{kind, worker?, circuit?, payload}` — modeled
/// here directly as [`appproxy_core::model::Event`].
#[async_trait]
pub trait EventBus: Send + Sync {
	async fn publish(&self, event: appproxy_core::model::Event) -> Result<(), StoreError>;

	async fn subscribe(&self) -> Result<EventStream<appproxy_core::model::Event>, StoreError>;
}

/// Combined store handle both coordinator and worker depend on.
pub trait Store: KvStore + EventBus {}
impl<T: KvStore + EventBus> Store for T {}
