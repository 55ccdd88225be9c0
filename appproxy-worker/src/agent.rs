//! Worker Agent: registers the authority with the
//! coordinator, seeds the in-memory circuit table with a reconciliation
//! fetch, then stays converged off the `coordinator/events` stream with
//! polling as a fallback. A second loop flushes inference last-access
//! timestamps.

use std::sync::Arc;
use std::time::Duration;

use appproxy_core::model::Event;
use appproxy_store::kv::EventBus;
use backoff::ExponentialBackoffBuilder;
use backoff::future::retry;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordinator_client::CoordinatorClient;
use crate::state::CircuitTable;
use crate::telemetry::Metrics;

#[derive(Clone)]
pub struct Agent {
	authority: String,
	coordinator: Arc<CoordinatorClient>,
	bus: Arc<dyn EventBus>,
	table: Arc<CircuitTable>,
	metrics: Arc<Metrics>,
}

impl Agent {
	pub fn new(
		authority: String,
		coordinator: Arc<CoordinatorClient>,
		bus: Arc<dyn EventBus>,
		table: Arc<CircuitTable>,
		metrics: Arc<Metrics>,
	) -> Self {
		Self { authority, coordinator, bus, table, metrics }
	}

	/// Registers with the coordinator, retrying with capped exponential
	/// backoff. Then seeds the circuit table from a full fetch before
	/// the caller starts the event-subscription loop, so the worker never
	/// has a window where it believes itself registered but holds no
	/// circuits that were created before it came up.
	pub async fn register_and_reconcile(&self, config: &crate::config::Config) -> anyhow::Result<()> {
		let backoff = ExponentialBackoffBuilder::new().with_max_elapsed_time(Some(Duration::from_secs(60))).build();
		retry(backoff, || async {
			self.coordinator.register(config).await.map_err(|err| {
				warn!(error = %err, "worker registration failed, retrying");
				backoff::Error::transient(err)
			})
		})
		.await?;
		info!(authority = %self.authority, "registered with coordinator");

		let circuits = self.coordinator.list_circuits(&self.authority).await?;
		info!(count = circuits.len(), "reconciled circuits from coordinator");
		for circuit in circuits {
			self.table.install(circuit).await;
		}
		Ok(())
	}

	/// Consumes `coordinator/events`, applying circuit installs/removals
	/// to the local table. A dropped or lagging subscription is not fatal:
	/// the periodic reconciliation fallback (driven by the caller) closes
	/// any gap note.
	pub async fn run_event_loop(&self, cancel: CancellationToken) -> anyhow::Result<()> {
		let mut stream = self.bus.subscribe().await?;
		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					info!("agent event loop shutting down");
					return Ok(());
				}
				next = stream.next() => {
					let Some(event) = next else {
						warn!("event stream ended, reconnecting");
						stream = self.bus.subscribe().await?;
						continue;
					};
					match event {
						Ok(event) => self.apply_event(event).await,
						Err(err) => {
							self.metrics.event_errors.inc();
							warn!(error = %err, "event stream error");
						}
					}
				}
			}
		}
	}

	async fn apply_event(&self, event: Event) {
		match event {
			Event::CircuitCreated { circuit } | Event::CircuitUpdated { circuit } => {
				if circuit.worker.as_str() == self.authority {
					self.table.install(circuit).await;
				}
			},
			Event::CircuitRemoved { circuit_id, worker, .. } => {
				if worker.as_str() == self.authority {
					self.table.uninstall(circuit_id).await;
				}
			},
			Event::WorkerRemoved { authority } => {
				if authority.as_str() == self.authority {
					warn!("coordinator reports this worker as removed; re-registration required");
				}
			},
			Event::WorkerRegistered { .. } | Event::Anomaly { .. } => {},
		}
	}

	/// Periodically reports last-access for every inference circuit
	/// touched since the previous pass.
	/// A reporting failure is logged and retried next tick rather than
	/// retried inline, so a slow coordinator never backs up this loop.
	pub async fn run_last_access_flush(&self, interval: Duration, cancel: CancellationToken) {
		let mut ticker = tokio::time::interval(interval);
		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					info!("last-access flush loop shutting down");
					return;
				}
				_ = ticker.tick() => {
					for circuit_id in self.table.drain_dirty().await {
						if let Err(err) = self.coordinator.touch_circuit(circuit_id).await {
							self.metrics.last_access_flush_failed.inc();
							warn!(circuit_id = %circuit_id, error = %err, "last-access flush failed");
						}
					}
				}
			}
		}
	}

	/// Polling fallback that re-fetches the authoritative circuit set and
	/// reconciles it against the local table, catching anything the event
	/// stream missed.
	pub async fn run_reconcile_poll(&self, interval: Duration, cancel: CancellationToken) {
		let mut ticker = tokio::time::interval(interval);
		loop {
			tokio::select! {
				_ = cancel.cancelled() => return,
				_ = ticker.tick() => {
					match self.coordinator.list_circuits(&self.authority).await {
						Ok(circuits) => {
							let live: std::collections::HashSet<_> = circuits.iter().map(|c| c.id).collect();
							for circuit in circuits {
								self.table.install(circuit).await;
							}
							for stale in self.table.snapshot().await.iter().map(|c| c.id).collect::<Vec<_>>() {
								if !live.contains(&stale) {
									self.table.uninstall(stale).await;
								}
							}
						}
						Err(err) => warn!(error = %err, "reconciliation poll failed"),
					}
				}
			}
		}
	}
}
