use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use appproxy_coordinator::api;
use appproxy_coordinator::circuit_registry::{CircuitRegistry, FingerprintWaiters};
use appproxy_coordinator::config::Config;
use appproxy_coordinator::slot_ledger::SlotLedger;
use appproxy_coordinator::state::AppState;
use appproxy_coordinator::sweeper::Sweeper;
use appproxy_coordinator::telemetry::Metrics;
use appproxy_coordinator::token_vault::TokenVault;
use appproxy_coordinator::worker_selector::WorkerSelector;
use appproxy_core::metrics::MetricsApp;
use appproxy_store::etcd::EtcdStore;
use appproxy_store::kv::{EventBus, KvStore};
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "appproxy-coordinator", version, about)]
struct Args {
	/// Path to a YAML config file.
	#[arg(short, long, value_name = "file")]
	config: Option<PathBuf>,
	/// Inline YAML config, mutually exclusive with --config.
	#[arg(long, value_name = "yaml")]
	config_bytes: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let config = match (args.config, args.config_bytes) {
		(Some(_), Some(_)) => {
			eprintln!("config error: --config and --config-bytes are mutually exclusive, exiting");
			std::process::exit(64);
		},
		(Some(path), None) => {
			let raw = tokio::fs::read_to_string(&path).await?;
			Config::from_yaml_str(&raw)?
		},
		(None, Some(raw)) => Config::from_yaml_str(&raw)?,
		(None, None) => {
			eprintln!("config error: one of --config or --config-bytes is required, exiting");
			std::process::exit(64);
		},
	};

	match run(config).await {
		Ok(()) => Ok(()),
		Err(err) => {
			tracing::error!(error = %err, "coordinator exited with an error");
			std::process::exit(70);
		},
	}
}

async fn run(config: Config) -> Result<()> {
	let config = Arc::new(config);

	if let Some(telemetry) = config.telemetry.clone() {
		appproxy_core::telemetry::init_tracer("appproxy-coordinator", telemetry)?;
	}

	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let metrics_app = MetricsApp::new(Arc::new(registry));

	let etcd = Arc::new(EtcdStore::connect(&config.store_endpoints, None).await?);
	let store: Arc<dyn KvStore> = etcd.clone();
	let bus: Arc<dyn EventBus> = etcd;

	let slot_ledger = Arc::new(SlotLedger::new(store.clone()));
	let waiters = Arc::new(RwLock::new(FingerprintWaiters::default()));
	let reuse_wait = Duration::from_millis(config.reuse_wait_millis);
	let circuit_registry =
		Arc::new(CircuitRegistry::new(store.clone(), bus.clone(), slot_ledger.clone(), waiters, reuse_wait, metrics.clone()));
	let worker_selector = Arc::new(WorkerSelector::new(store.clone(), slot_ledger.clone(), metrics.clone()));
	let token_vault = Arc::new(TokenVault::new(store.clone()));

	let state =
		AppState::new(config.clone(), store.clone(), bus, slot_ledger, circuit_registry.clone(), worker_selector, token_vault, metrics.clone());

	let mut tasks = JoinSet::new();

	let api_listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
	let api_router = api::router().with_state(state).layer(tower_http::trace::TraceLayer::new_for_http());
	tasks.spawn(async move {
		tracing::info!(addr = %api_listener.local_addr().unwrap(), "coordinator REST API listening");
		axum::serve(api_listener, api_router).await
	});

	let metrics_listener = tokio::net::TcpListener::bind(config.metrics_addr).await?;
	let metrics_router = metrics_app.router();
	tasks.spawn(async move {
		tracing::info!(addr = %metrics_listener.local_addr().unwrap(), "metrics listening");
		axum::serve(metrics_listener, metrics_router).await
	});

	let sweeper = Sweeper::new(store, circuit_registry, metrics, Duration::from_secs(config.sweep_interval_secs));
	let cancel = CancellationToken::new();
	let sweeper_cancel = cancel.clone();
	tasks.spawn(async move {
		sweeper.run(sweeper_cancel).await;
		Ok::<(), std::io::Error>(())
	});
	tasks.spawn(async move {
		let _ = tokio::signal::ctrl_c().await;
		tracing::info!("received shutdown signal");
		cancel.cancel();
		Ok::<(), std::io::Error>(())
	});

	while let Some(result) = tasks.join_next().await {
		result??;
	}
	Ok(())
}
