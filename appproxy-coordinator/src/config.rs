use std::net::SocketAddr;

use appproxy_core::telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};

/// Coordinator config file contract. Loaded via `--config`/`-c` (file path)
/// or `--config-bytes` (inline YAML).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Address the REST API listens on.
	pub listen_addr: SocketAddr,
	/// Address the `/metrics` endpoint listens on.
	#[serde(default = "default_metrics_addr")]
	pub metrics_addr: SocketAddr,
	/// etcd endpoints backing the persistent store.
	pub store_endpoints: Vec<String>,
	/// Shared secret the Backend.AI Manager presents as `X-BackendAI-Token`.
	pub manager_token: String,
	/// Shared secret worker agents present as `X-BackendAI-Token`.
	pub worker_token: String,
	/// How often the inference idle-TTL sweeper scans `coordinator/endpoints/`.
	#[serde(default = "default_sweep_interval_secs")]
	pub sweep_interval_secs: u64,
	/// Confirmation token TTL.
	#[serde(default = "default_confirmation_ttl_secs")]
	pub confirmation_token_ttl_secs: u64,
	/// Deadline the fingerprint-lock loser waits for the winner's
	/// circuit-created event before retrying.
	#[serde(default = "default_reuse_wait_millis")]
	pub reuse_wait_millis: u64,
	#[serde(default)]
	pub telemetry: Option<TelemetryConfig>,
}

fn default_metrics_addr() -> SocketAddr {
	"0.0.0.0:19000".parse().unwrap()
}

fn default_sweep_interval_secs() -> u64 {
	30
}

fn default_confirmation_ttl_secs() -> u64 {
	300
}

fn default_reuse_wait_millis() -> u64 {
	2000
}

impl Config {
	pub fn from_yaml_str(s: &str) -> anyhow::Result<Self> {
		Ok(serde_yaml::from_str(s)?)
	}
}
