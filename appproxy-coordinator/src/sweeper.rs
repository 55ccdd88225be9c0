//! Inference idle-TTL sweeper: evicts an
//! inference circuit when `now - last_access >= ttl_seconds`. The
//! worker's periodic last-access report is what keeps a live
//! circuit's `updated_at` moving forward; a circuit is considered idle
//! once the gap since that timestamp exceeds its endpoint's configured
//! TTL. `ttl_seconds: None` means no eviction: no TTL unless explicitly
//! configured on the endpoint.

use std::sync::Arc;
use std::time::Duration;

use appproxy_core::model::Endpoint;
use appproxy_store::kv::KvStore;
use appproxy_store::{keys, typed};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::circuit_registry::CircuitRegistry;
use crate::telemetry::Metrics;

pub struct Sweeper {
	store: Arc<dyn KvStore>,
	registry: Arc<CircuitRegistry>,
	metrics: Arc<Metrics>,
	interval: Duration,
}

impl Sweeper {
	pub fn new(
		store: Arc<dyn KvStore>,
		registry: Arc<CircuitRegistry>,
		metrics: Arc<Metrics>,
		interval: Duration,
	) -> Self {
		Self { store, registry, metrics, interval }
	}

	pub async fn run(self, cancel: CancellationToken) {
		let mut ticker = tokio::time::interval(self.interval);
		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					info!("sweeper shutting down");
					return;
				}
				_ = ticker.tick() => {
					if let Err(err) = self.sweep_once().await {
						warn!(error = %err, "sweep pass failed");
					}
				}
			}
		}
	}

	async fn sweep_once(&self) -> Result<(), appproxy_store::StoreError> {
		let endpoints = typed::list_typed::<Endpoint>(self.store.as_ref(), &keys::endpoints_prefix()).await?;
		for (_, endpoint) in endpoints {
			let (Some(ttl_seconds), Some(circuit_id)) = (endpoint.ttl_seconds, endpoint.circuit_id) else {
				continue;
			};
			let Some(circuit) = self.registry.get(circuit_id).await? else { continue };
			let idle_for = Utc::now().signed_duration_since(circuit.updated_at);
			if idle_for.num_seconds() < 0 {
				continue;
			}
			if idle_for.num_seconds() as u64 >= ttl_seconds {
				info!(circuit_id = %circuit_id, endpoint_id = %endpoint.id, idle_secs = idle_for.num_seconds(), "evicting idle inference circuit");
				match self.registry.remove(circuit_id).await {
					Ok(_) => {
						self.metrics.endpoints_swept.inc();
					},
					Err(err) => {
						warn!(circuit_id = %circuit_id, error = %err, "failed to evict idle circuit");
						continue;
					},
				};
				let mut updated = endpoint.clone();
				updated.circuit_id = None;
				typed::put_typed(self.store.as_ref(), &keys::endpoint(&endpoint.id.to_string()), &updated).await?;
			}
		}
		Ok(())
	}
}
