//! Thin HTTP client for the worker→coordinator direction: registration,
//! the periodic last-access flush, and the startup reconciliation
//! fetch. All calls carry the worker's `X-BackendAI-Token`.

use appproxy_core::model::{AppFilter, Circuit, FrontendMode, Protocol, TrafficClass, Worker};
use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorClientError {
	#[error("coordinator request failed: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("coordinator returned {status}: {body}")]
	Rejected { status: u16, body: String },
}

#[derive(Clone)]
pub struct CoordinatorClient {
	http: Client,
	base_url: String,
	worker_token: String,
	/// Generated once per process and reused on every registration call
	/// (including retries), so re-registering this same process never
	/// looks like a new HA node joining.
	node_id: Uuid,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
	authority: &'a str,
	node_id: Uuid,
	frontend_mode: FrontendMode,
	protocol: Protocol,
	hostname: &'a str,
	use_tls: bool,
	api_port: u16,
	#[serde(skip_serializing_if = "Option::is_none")]
	port_range: &'a Option<Vec<u16>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	wildcard_domain: &'a Option<String>,
	filtered_apps_only: bool,
	accepted_traffics: &'a [TrafficClass],
	app_filters: &'a [AppFilter],
}

impl CoordinatorClient {
	pub fn new(config: &Config) -> Self {
		Self {
			http: Client::new(),
			base_url: config.coordinator_base_url.trim_end_matches('/').to_string(),
			worker_token: config.worker_token.clone(),
			node_id: Uuid::new_v4(),
		}
	}

	async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, CoordinatorClientError> {
		if resp.status().is_success() {
			Ok(resp)
		} else {
			let status = resp.status().as_u16();
			let body = resp.text().await.unwrap_or_default();
			Err(CoordinatorClientError::Rejected { status, body })
		}
	}

	/// `PUT /api/worker`: registers (or re-registers) this authority.
	pub async fn register(&self, config: &Config) -> Result<Worker, CoordinatorClientError> {
		let req = RegisterRequest {
			authority: &config.authority,
			node_id: self.node_id,
			frontend_mode: config.frontend_mode,
			protocol: config.protocol,
			hostname: &config.hostname,
			use_tls: config.use_tls,
			api_port: config.api_port,
			port_range: &config.port_range,
			wildcard_domain: &config.wildcard_domain,
			filtered_apps_only: config.filtered_apps_only,
			accepted_traffics: &config.accepted_traffics,
			app_filters: &config.app_filters,
		};
		let resp = self
			.http
			.put(format!("{}/api/worker", self.base_url))
			.header("X-BackendAI-Token", &self.worker_token)
			.json(&req)
			.send()
			.await?;
		Ok(Self::check_status(resp).await?.json().await?)
	}

	/// `POST /api/circuit/{id}/touch`: reports a fresh last-access
	/// timestamp for an inference circuit.
	pub async fn touch_circuit(&self, circuit_id: uuid::Uuid) -> Result<(), CoordinatorClientError> {
		let resp = self
			.http
			.post(format!("{}/api/circuit/{circuit_id}/touch", self.base_url))
			.header("X-BackendAI-Token", &self.worker_token)
			.send()
			.await?;
		Self::check_status(resp).await?;
		Ok(())
	}

	/// `GET /api/worker/{authority}/circuits`: used at startup to seed the
	/// in-memory circuit table before the event stream catches up, and as
	/// the polling fallback when event delivery stalls.
	pub async fn list_circuits(&self, authority: &str) -> Result<Vec<Circuit>, CoordinatorClientError> {
		let resp = self
			.http
			.get(format!("{}/api/worker/{authority}/circuits", self.base_url))
			.header("X-BackendAI-Token", &self.worker_token)
			.send()
			.await?;
		Ok(Self::check_status(resp).await?.json().await?)
	}
}
