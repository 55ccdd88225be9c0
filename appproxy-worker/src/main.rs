use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use appproxy_worker::agent::Agent;
use appproxy_worker::config::Config;
use appproxy_worker::coordinator_client::CoordinatorClient;
use appproxy_worker::frontend::Frontend;
use appproxy_worker::pool::BackendPool;
use appproxy_worker::state::{AppState, CircuitTable};
use appproxy_worker::telemetry::Metrics;
use appproxy_worker::api;
use appproxy_core::metrics::MetricsApp;
use appproxy_store::etcd::EtcdStore;
use appproxy_store::kv::{EventBus, KvStore};
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "appproxy-worker", version, about)]
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
			tracing::error!(error = %err, "worker exited with an error");
			std::process::exit(70);
		},
	}
}

async fn run(config: Config) -> Result<()> {
	let config = Arc::new(config);

	if let Some(telemetry) = config.telemetry.clone() {
		appproxy_core::telemetry::init_tracer("appproxy-worker", telemetry)?;
	}

	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let metrics_app = MetricsApp::new(Arc::new(registry));

	let etcd = Arc::new(EtcdStore::connect(&config.store_endpoints, None).await?);
	let store: Arc<dyn KvStore> = etcd.clone();
	let bus: Arc<dyn EventBus> = etcd;

	let table = Arc::new(CircuitTable::new());
	let backend_pool = Arc::new(BackendPool::new(config.pool_max_per_key));
	let coordinator = Arc::new(CoordinatorClient::new(&config));

	let state = AppState::new(config.clone(), table.clone(), backend_pool.clone(), coordinator.clone(), metrics.clone(), store);

	let agent = Agent::new(config.authority.clone(), coordinator, bus, table, metrics.clone());
	agent.register_and_reconcile(&config).await?;
	let reconcile_interval = Duration::from_secs(10);

	let mut tasks = JoinSet::new();
	let cancel = CancellationToken::new();

	let api_listener = tokio::net::TcpListener::bind(config.api_listen_addr).await?;
	let api_router = api::router().with_state(state.clone()).layer(tower_http::trace::TraceLayer::new_for_http());
	tasks.spawn(async move {
		tracing::info!(addr = %api_listener.local_addr().unwrap(), "worker control surface listening");
		axum::serve(api_listener, api_router).await?;
		Ok::<(), anyhow::Error>(())
	});

	let metrics_listener = tokio::net::TcpListener::bind(config.metrics_addr).await?;
	let metrics_router = metrics_app.router();
	tasks.spawn(async move {
		tracing::info!(addr = %metrics_listener.local_addr().unwrap(), "metrics listening");
		axum::serve(metrics_listener, metrics_router).await?;
		Ok::<(), anyhow::Error>(())
	});

	let frontend = Frontend::new(state.clone())?;
	let frontend_cancel = cancel.clone();
	tasks.spawn(async move {
		frontend.serve(frontend_cancel).await?;
		Ok::<(), anyhow::Error>(())
	});

	let event_cancel = cancel.clone();
	let event_agent = agent.clone();
	tasks.spawn(async move { event_agent.run_event_loop(event_cancel).await });

	let flush_interval = Duration::from_millis(config.last_access_flush_millis);
	let flush_cancel = cancel.clone();
	let flush_agent = agent.clone();
	tasks.spawn(async move {
		flush_agent.run_last_access_flush(flush_interval, flush_cancel).await;
		Ok::<(), anyhow::Error>(())
	});

	let reconcile_cancel = cancel.clone();
	let reconcile_agent = agent;
	tasks.spawn(async move {
		reconcile_agent.run_reconcile_poll(reconcile_interval, reconcile_cancel).await;
		Ok::<(), anyhow::Error>(())
	});

	tasks.spawn(async move {
		let _ = tokio::signal::ctrl_c().await;
		tracing::info!("received shutdown signal");
		cancel.cancel();
		Ok::<(), anyhow::Error>(())
	});

	while let Some(result) = tasks.join_next().await {
		result??;
	}
	Ok(())
}
