//! Liveness/status probes. `/health` is intentionally
//! unauthenticated so load balancers and orchestrators can poll it;
//! `/health/status` requires the Manager token since it reveals cluster
//! topology.

use appproxy_core::error::ApiError;
use appproxy_core::model::Worker;
use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::authn::ManagerAuth;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
	pub status: &'static str,
}

pub async fn get_health() -> Json<HealthResponse> {
	Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
pub struct WorkerHealthReport {
	pub authority: String,
	pub nodes: u32,
	pub occupied_slots: usize,
	pub total_slots: Option<usize>,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatusResponse {
	pub workers: Vec<WorkerHealthReport>,
}

pub async fn get_health_status(
	State(state): State<AppState>,
	_auth: ManagerAuth,
) -> Result<Json<HealthStatusResponse>, ApiError> {
	let rows = appproxy_store::typed::list_typed::<Worker>(state.store.as_ref(), &appproxy_store::keys::workers_prefix())
		.await
		.map_err(super::store_err)?;

	let mut workers = Vec::with_capacity(rows.len());
	for (_, worker) in rows {
		let occupied = state.slot_ledger.occupied_count(&worker.authority).await.map_err(super::store_err)?;
		workers.push(WorkerHealthReport {
			authority: worker.authority.to_string(),
			nodes: worker.nodes(),
			occupied_slots: occupied,
			total_slots: worker.total_slots(),
			updated_at: worker.updated_at,
		});
	}
	Ok(Json(HealthStatusResponse { workers }))
}
