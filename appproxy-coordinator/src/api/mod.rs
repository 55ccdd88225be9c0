//! Coordinator REST API: a Manager-facing surface under `/v2`
//! and a worker-facing surface under `/api`, both mounted onto one
//! `Router<AppState>` alongside the unauthenticated `/health` probe.

pub mod health;
pub mod v2;
pub mod worker_api;

use appproxy_core::error::{ApiError, ErrorCode};
use appproxy_store::StoreError;
use axum::routing::{delete, get, post, put};
use axum::Router;

use crate::circuit_registry::RegistryError;
use crate::state::AppState;

pub(crate) fn store_err(e: StoreError) -> ApiError {
	ApiError::internal(e.to_string())
}

pub(crate) fn registry_err(e: RegistryError) -> ApiError {
	match e {
		RegistryError::NoSlotAvailable => ApiError::new(ErrorCode::NoSlotAvailable, "no free slot on the selected worker"),
		RegistryError::NotFound => ApiError::not_found("circuit"),
		RegistryError::CreationTimedOut => {
			ApiError::new(ErrorCode::SetupTimeout, "timed out waiting for a concurrent circuit creation")
		},
		RegistryError::Store(e) => store_err(e),
	}
}

pub fn router() -> Router<AppState> {
	Router::new()
		.route("/v2/conf", post(v2::post_conf))
		.route("/v2/proxy/auth", get(v2::get_proxy_auth).post(v2::get_proxy_auth))
		.route("/v2/proxy/{token}/{session_id}/add", get(v2::get_proxy_legacy_alias))
		.route("/v2/endpoints/{id}", post(v2::put_endpoint).delete(v2::delete_endpoint))
		.route("/v2/endpoints/{id}/token", post(v2::post_endpoint_token))
		.route("/api/circuit/{id}", get(worker_api::get_circuit).delete(worker_api::delete_circuit))
		.route("/api/circuit/{id}/statistics", get(worker_api::get_circuit_statistics))
		.route("/api/circuit/{id}/touch", post(worker_api::touch_circuit))
		.route("/api/circuit/_/bulk", delete(worker_api::delete_circuits_bulk))
		.route("/api/slots", get(worker_api::get_slots))
		.route("/api/worker", put(worker_api::put_worker).get(worker_api::get_workers))
		.route(
			"/api/worker/{authority}",
			get(worker_api::get_worker).patch(worker_api::patch_worker).delete(worker_api::delete_worker),
		)
		.route("/api/worker/{authority}/circuits", get(worker_api::get_worker_circuits))
		.route("/health", get(health::get_health))
		.route("/health/status", get(health::get_health_status))
}
