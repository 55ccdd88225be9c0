//! Production [`KvStore`]/[`EventBus`] backed by etcd. Every coordinator
//! replica and worker agent talks to the same etcd cluster, so this is
//! also what gives the cluster its single source of truth.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
	Client, Compare, CompareOp, ConnectOptions, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use futures::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use crate::error::StoreError;
use crate::kv::{EventBus, EventStream, KvStore, WatchEvent, WatchStream};
use appproxy_core::model::Event;

/// Prefix under which every published event is written as its own key,
/// leased to expire a short while after publication so the tree doesn't
/// grow unbounded; subscribers consume them via a watch on the prefix,
/// not via reads.
const EVENTS_PREFIX: &str = "coordinator/events/";
const EVENT_LEASE_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct EtcdStore {
	client: Client,
}

impl EtcdStore {
	pub async fn connect(
		endpoints: &[String],
		options: Option<ConnectOptions>,
	) -> Result<Self, StoreError> {
		let client = Client::connect(endpoints, options).await?;
		Ok(Self { client })
	}
}

#[async_trait]
impl KvStore for EtcdStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		let mut kv = self.client.kv_client();
		let resp = kv.get(key, None).await?;
		Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
	}

	async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
		let mut kv = self.client.kv_client();
		kv.put(key, value, None).await?;
		Ok(())
	}

	async fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
		let mut lease = self.client.lease_client();
		let grant = lease.grant(ttl.as_secs().max(1) as i64, None).await?;
		let mut kv = self.client.kv_client();
		kv.put(key, value, Some(PutOptions::new().with_lease(grant.id()))).await?;
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StoreError> {
		let mut kv = self.client.kv_client();
		kv.delete(key, None).await?;
		Ok(())
	}

	async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
		let mut kv = self.client.kv_client();
		let resp = kv.get(prefix, Some(GetOptions::new().with_prefix())).await?;
		Ok(
			resp
				.kvs()
				.iter()
				.map(|kv| (String::from_utf8_lossy(kv.key()).into_owned(), kv.value().to_vec()))
				.collect(),
		)
	}

	async fn create_if_absent(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<bool, StoreError> {
		let lease_id = match ttl {
			Some(ttl) => {
				let mut lease = self.client.lease_client();
				let grant = lease.grant(ttl.as_secs().max(1) as i64, None).await?;
				Some(grant.id())
			},
			None => None,
		};
		let put_op = match lease_id {
			Some(id) => TxnOp::put(key, value, Some(PutOptions::new().with_lease(id))),
			None => TxnOp::put(key, value, None),
		};
		let txn = Txn::new()
			.when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
			.and_then(vec![put_op]);
		let mut kv = self.client.kv_client();
		let resp = kv.txn(txn).await?;
		Ok(resp.succeeded())
	}

	async fn cas_delete(&self, key: &str, expect: &[u8]) -> Result<bool, StoreError> {
		let txn = Txn::new()
			.when(vec![Compare::value(key, CompareOp::Equal, expect)])
			.and_then(vec![TxnOp::delete(key, None)]);
		let mut kv = self.client.kv_client();
		let resp = kv.txn(txn).await?;
		Ok(resp.succeeded())
	}

	async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError> {
		let mut watch = self.client.watch_client();
		let (_watcher, mut stream) =
			watch.watch(prefix, Some(WatchOptions::new().with_prefix())).await?;
		let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
		tokio::spawn(async move {
			while let Ok(Some(resp)) = stream.message().await {
				for event in resp.events() {
					let Some(kv) = event.kv() else { continue };
					let key = String::from_utf8_lossy(kv.key()).into_owned();
					let out = match event.event_type() {
						etcd_client::EventType::Put => WatchEvent::Put { key, value: kv.value().to_vec() },
						etcd_client::EventType::Delete => WatchEvent::Delete { key },
					};
					if tx.send(Ok(out)).is_err() {
						return;
					}
				}
			}
		});
		Ok(Box::pin(UnboundedReceiverStream::new(rx)))
	}
}

#[async_trait]
impl EventBus for EtcdStore {
	async fn publish(&self, event: Event) -> Result<(), StoreError> {
		let payload = serde_json::to_vec(&event)?;
		let key = format!("{EVENTS_PREFIX}{}", uuid::Uuid::new_v4());
		self.put_with_ttl(&key, payload, EVENT_LEASE_TTL).await
	}

	async fn subscribe(&self) -> Result<EventStream<Event>, StoreError> {
		let watch = self.watch_prefix(EVENTS_PREFIX).await?;
		let decoded = watch.filter_map(|res| async move {
			match res {
				Ok(WatchEvent::Put { value, .. }) => match serde_json::from_slice::<Event>(&value) {
					Ok(event) => Some(Ok(event)),
					Err(err) => {
						warn!(error = %err, "dropping malformed event payload");
						None
					},
				},
				// Events expire via lease rather than explicit delete; ignore.
				Ok(WatchEvent::Delete { .. }) => None,
				Err(err) => Some(Err(err)),
			}
		});
		Ok(Box::pin(decoded))
	}
}
