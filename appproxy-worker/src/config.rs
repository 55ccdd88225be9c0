//! Worker config contract: everything a worker agent needs
//! to register itself, accept connections, and reach the coordinator and
//! store, loaded the same way as the coordinator's `--config`/`--config-bytes`.

use std::net::SocketAddr;
use std::path::PathBuf;

use appproxy_core::model::{AppFilter, FrontendMode, Protocol, TrafficClass};
use appproxy_core::telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
	pub cert_path: PathBuf,
	pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// The authority this worker (or HA set of physical nodes) registers
	/// under.
	pub authority: String,
	pub frontend_mode: FrontendMode,
	pub protocol: Protocol,
	/// Required when `frontend_mode = port`.
	#[serde(default)]
	pub port_range: Option<Vec<u16>>,
	/// Required when `frontend_mode = wildcard`.
	#[serde(default)]
	pub wildcard_domain: Option<String>,
	/// Advertised hostname used to build circuit redirect URLs.
	pub hostname: String,
	#[serde(default)]
	pub use_tls: bool,
	#[serde(default)]
	pub tls: Option<TlsConfig>,
	/// Single HTTPS port the wildcard frontend listens on; ignored for
	/// `frontend_mode = port`.
	#[serde(default = "default_wildcard_listen_port")]
	pub wildcard_listen_port: u16,
	/// Port the worker-local control surface (`/circuits/{id}`, `/healthz`)
	/// listens on.
	pub api_port: u16,
	pub api_listen_addr: SocketAddr,
	#[serde(default = "default_metrics_addr")]
	pub metrics_addr: SocketAddr,
	#[serde(default)]
	pub filtered_apps_only: bool,
	#[serde(default)]
	pub app_filters: Vec<AppFilter>,
	pub accepted_traffics: Vec<TrafficClass>,
	pub coordinator_base_url: String,
	pub store_endpoints: Vec<String>,
	/// Shared secret presented as `X-BackendAI-Token` to the coordinator.
	pub worker_token: String,
	/// Last-access flush cadence.
	#[serde(default = "default_last_access_flush_millis")]
	pub last_access_flush_millis: u64,
	/// Maximum concurrent connections the backend pool allows to any
	/// single kernel host:port.
	#[serde(default = "default_pool_max_per_key")]
	pub pool_max_per_key: usize,
	/// Whether `X-Forwarded-For` is trusted for the CIDR admission check.
	#[serde(default)]
	pub trust_forwarded_for: bool,
	#[serde(default)]
	pub telemetry: Option<TelemetryConfig>,
}

fn default_wildcard_listen_port() -> u16 {
	443
}

fn default_metrics_addr() -> SocketAddr {
	"0.0.0.0:19001".parse().unwrap()
}

fn default_last_access_flush_millis() -> u64 {
	800
}

fn default_pool_max_per_key() -> usize {
	32
}

impl Config {
	pub fn from_yaml_str(s: &str) -> anyhow::Result<Self> {
		let config: Config = serde_yaml::from_str(s)?;
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> anyhow::Result<()> {
		match self.frontend_mode {
			FrontendMode::Port => {
				if self.port_range.as_ref().is_none_or(|r| r.is_empty()) {
					anyhow::bail!("frontend_mode = port requires a non-empty port_range");
				}
			},
			FrontendMode::Wildcard => {
				if self.wildcard_domain.is_none() {
					anyhow::bail!("frontend_mode = wildcard requires wildcard_domain");
				}
			},
		}
		if self.use_tls && self.tls.is_none() {
			anyhow::bail!("use_tls = true requires a [tls] section");
		}
		Ok(())
	}
}
