use std::sync::Arc;

use appproxy_store::kv::{EventBus, KvStore};

use crate::circuit_registry::CircuitRegistry;
use crate::config::Config;
use crate::slot_ledger::SlotLedger;
use crate::telemetry::Metrics;
use crate::token_vault::TokenVault;
use crate::worker_selector::WorkerSelector;

/// Per-process singleton handed to every handler and background task,
/// built once at startup.
#[derive(Clone)]
pub struct AppState {
	pub config: Arc<Config>,
	pub store: Arc<dyn KvStore>,
	pub bus: Arc<dyn EventBus>,
	pub slot_ledger: Arc<SlotLedger>,
	pub circuit_registry: Arc<CircuitRegistry>,
	pub worker_selector: Arc<WorkerSelector>,
	pub token_vault: Arc<TokenVault>,
	pub metrics: Arc<Metrics>,
}

impl AppState {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: Arc<Config>,
		store: Arc<dyn KvStore>,
		bus: Arc<dyn EventBus>,
		slot_ledger: Arc<SlotLedger>,
		circuit_registry: Arc<CircuitRegistry>,
		worker_selector: Arc<WorkerSelector>,
		token_vault: Arc<TokenVault>,
		metrics: Arc<Metrics>,
	) -> Self {
		Self { config, store, bus, slot_ledger, circuit_registry, worker_selector, token_vault, metrics }
	}
}
