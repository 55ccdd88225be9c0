//! Worker-local HTTP surface: `PUT /circuits/{id}`,
//! `DELETE /circuits/{id}`, `GET /healthz`. This is the coordinator's
//! provisioning RPC path; its failure is non-fatal because the agent's
//! event-subscription loop (`agent.rs`) converges the same state
//! independently.

use appproxy_core::error::{ApiError, ErrorCode};
use appproxy_core::model::Circuit;
use axum::Router;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::Json;
use http::request::Parts;
use uuid::Uuid;

use crate::state::AppState;

pub const TOKEN_HEADER: &str = "x-backendai-token";

pub struct WorkerAuth;

impl FromRequestParts<AppState> for WorkerAuth {
	type Rejection = ApiError;

	async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
		let token = parts
			.headers
			.get(TOKEN_HEADER)
			.and_then(|v| v.to_str().ok())
			.ok_or_else(|| ApiError::new(ErrorCode::MissingAuthToken, "missing X-BackendAI-Token header"))?;
		if token == state.config.worker_token {
			Ok(WorkerAuth)
		} else {
			Err(ApiError::new(ErrorCode::InvalidAuthToken, "unrecognized X-BackendAI-Token"))
		}
	}
}

pub fn router() -> Router<AppState> {
	Router::new()
		.route("/circuits/{id}", put(install_circuit).delete(uninstall_circuit))
		.route("/healthz", get(healthz))
}

async fn install_circuit(
	_auth: WorkerAuth,
	State(state): State<AppState>,
	Path(id): Path<Uuid>,
	Json(circuit): Json<Circuit>,
) -> Result<StatusCode, ApiError> {
	if circuit.id != id {
		return Err(ApiError::new(ErrorCode::Internal, "circuit id in path does not match body"));
	}
	state.table.install(circuit).await;
	state.metrics.circuits_installed.inc();
	Ok(StatusCode::NO_CONTENT)
}

async fn uninstall_circuit(
	_auth: WorkerAuth,
	State(state): State<AppState>,
	Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
	if state.table.uninstall(id).await.is_some() {
		state.metrics.circuits_uninstalled.inc();
		Ok(StatusCode::NO_CONTENT)
	} else {
		Err(ApiError::not_found(format!("no circuit {id} installed on this worker")))
	}
}

async fn healthz() -> StatusCode {
	StatusCode::OK
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use appproxy_core::model::{AppMode, FrontendMode, Protocol};
	use appproxy_store::memory::MemoryStore;
	use axum::body::Body;
	use axum::http::Request;
	use chrono::Utc;
	use prometheus_client::registry::Registry;
	use tower::ServiceExt;

	use super::*;
	use crate::config::Config;
	use crate::coordinator_client::CoordinatorClient;
	use crate::pool::BackendPool;
	use crate::state::CircuitTable;
	use crate::telemetry::Metrics;

	fn test_state() -> AppState {
		let config = Arc::new(Config {
			authority: "worker1".into(),
			frontend_mode: FrontendMode::Port,
			protocol: Protocol::Http,
			port_range: Some(vec![10205]),
			wildcard_domain: None,
			hostname: "worker1.internal".into(),
			use_tls: false,
			tls: None,
			wildcard_listen_port: 443,
			api_port: 6021,
			api_listen_addr: "0.0.0.0:6021".parse().unwrap(),
			metrics_addr: "0.0.0.0:19001".parse().unwrap(),
			filtered_apps_only: false,
			app_filters: vec![],
			accepted_traffics: vec![],
			coordinator_base_url: "http://coordinator".into(),
			store_endpoints: vec!["http://localhost:2379".into()],
			worker_token: "wtok".into(),
			last_access_flush_millis: 800,
			pool_max_per_key: 32,
			trust_forwarded_for: false,
			telemetry: None,
		});
		let mut registry = Registry::default();
		AppState::new(
			config.clone(),
			Arc::new(CircuitTable::new()),
			Arc::new(BackendPool::new(32)),
			Arc::new(CoordinatorClient::new(&config)),
			Arc::new(Metrics::new(&mut registry)),
			Arc::new(MemoryStore::new()),
		)
	}

	fn sample_circuit(id: Uuid) -> Circuit {
		Circuit {
			id,
			app: "jupyter".into(),
			protocol: Protocol::Http,
			worker: "worker1".into(),
			app_mode: AppMode::Interactive,
			frontend_mode: FrontendMode::Port,
			envs: Default::default(),
			arguments: None,
			open_to_public: true,
			allowed_client_ips: None,
			port: Some(10205),
			subdomain: None,
			user_id: Some(Uuid::new_v4()),
			endpoint_id: None,
			route_info: vec![],
			session_ids: vec![Uuid::new_v4()],
			auth_secret: None,
			created_at: Utc::now(),
			updated_at: Utc::now(),
		}
	}

	#[tokio::test]
	async fn install_requires_worker_token() {
		let state = test_state();
		let app = router().with_state(state);
		let id = Uuid::new_v4();
		let body = serde_json::to_vec(&sample_circuit(id)).unwrap();
		let req = Request::builder()
			.method("PUT")
			.uri(format!("/circuits/{id}"))
			.header("content-type", "application/json")
			.body(Body::from(body))
			.unwrap();
		let resp = app.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::FORBIDDEN);
	}

	#[tokio::test]
	async fn install_then_uninstall_round_trips() {
		let state = test_state();
		let table = state.table.clone();
		let app = router().with_state(state);
		let id = Uuid::new_v4();
		let body = serde_json::to_vec(&sample_circuit(id)).unwrap();
		let req = Request::builder()
			.method("PUT")
			.uri(format!("/circuits/{id}"))
			.header("content-type", "application/json")
			.header(TOKEN_HEADER, "wtok")
			.body(Body::from(body))
			.unwrap();
		let resp = app.clone().oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::NO_CONTENT);
		assert!(table.get_by_id(id).await.is_some());

		let req = Request::builder()
			.method("DELETE")
			.uri(format!("/circuits/{id}"))
			.header(TOKEN_HEADER, "wtok")
			.body(Body::empty())
			.unwrap();
		let resp = app.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::NO_CONTENT);
		assert!(table.get_by_id(id).await.is_none());
	}

	#[tokio::test]
	async fn healthz_is_open() {
		let state = test_state();
		let app = router().with_state(state);
		let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
		let resp = app.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
	}
}
