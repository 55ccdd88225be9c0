//! Worker-facing surface: circuit introspection/teardown, slot
//! listing, and worker registration/patch/removal. Every route here
//! requires the worker-scoped bearer token.

use std::collections::BTreeSet;

use appproxy_core::error::ApiError;
use appproxy_core::model::{AppFilter, Circuit, FrontendMode, Protocol, TrafficClass, Worker};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::authn::WorkerAuth;
use crate::circuit_registry::RegistryError;
use crate::state::AppState;

pub async fn get_circuit(
	State(state): State<AppState>,
	_auth: WorkerAuth,
	Path(id): Path<Uuid>,
) -> Result<Json<Circuit>, ApiError> {
	state.circuit_registry.get(id).await.map_err(super::store_err)?.map(Json).ok_or_else(|| ApiError::not_found("circuit"))
}

#[derive(Debug, Serialize)]
pub struct CircuitStatistics {
	pub circuit_id: Uuid,
	pub last_access: chrono::DateTime<Utc>,
	pub session_count: usize,
}

pub async fn get_circuit_statistics(
	State(state): State<AppState>,
	_auth: WorkerAuth,
	Path(id): Path<Uuid>,
) -> Result<Json<CircuitStatistics>, ApiError> {
	let circuit = state.circuit_registry.get(id).await.map_err(super::store_err)?.ok_or_else(|| ApiError::not_found("circuit"))?;
	Ok(Json(CircuitStatistics {
		circuit_id: circuit.id,
		last_access: circuit.updated_at,
		session_count: circuit.session_ids.len(),
	}))
}

/// `POST /api/circuit/{id}/touch`: records a last-access report from the
/// worker's periodic flush, keeping the idle-TTL sweeper from
/// evicting a circuit that is still serving live traffic.
pub async fn touch_circuit(
	State(state): State<AppState>,
	_auth: WorkerAuth,
	Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
	match state.circuit_registry.touch_last_access(id).await {
		Ok(()) => Ok(StatusCode::NO_CONTENT),
		Err(RegistryError::NotFound) => Err(ApiError::not_found("circuit")),
		Err(err) => Err(super::registry_err(err)),
	}
}

pub async fn delete_circuit(
	State(state): State<AppState>,
	_auth: WorkerAuth,
	Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
	match state.circuit_registry.remove(id).await {
		Ok(_) => Ok(StatusCode::NO_CONTENT),
		Err(RegistryError::NotFound) => Err(ApiError::not_found("circuit")),
		Err(err) => Err(super::registry_err(err)),
	}
}

#[derive(Debug, Serialize)]
pub struct BulkDeleteResponse {
	pub removed: Vec<Uuid>,
	pub not_found: Vec<Uuid>,
}

pub async fn delete_circuits_bulk(
	State(state): State<AppState>,
	_auth: WorkerAuth,
	Json(ids): Json<Vec<Uuid>>,
) -> Result<Json<BulkDeleteResponse>, ApiError> {
	let mut removed = Vec::new();
	let mut not_found = Vec::new();
	for id in ids {
		match state.circuit_registry.remove(id).await {
			Ok(_) => removed.push(id),
			Err(RegistryError::NotFound) => not_found.push(id),
			Err(err) => return Err(super::registry_err(err)),
		}
	}
	Ok(Json(BulkDeleteResponse { removed, not_found }))
}

#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
	pub authority: String,
}

/// `GET /api/slots?authority=...`: the raw occupied-slot keys for one
/// worker, as currently held in the Slot Ledger.
pub async fn get_slots(
	State(state): State<AppState>,
	_auth: WorkerAuth,
	Query(query): Query<SlotsQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
	let prefix = appproxy_store::keys::slots_prefix(&query.authority);
	let rows = state.store.list_prefix(&prefix).await.map_err(super::store_err)?;
	Ok(Json(rows.into_iter().filter_map(|(key, _)| key.strip_prefix(&prefix).map(str::to_string)).collect()))
}

#[derive(Debug, Deserialize)]
pub struct WorkerRegisterRequest {
	pub authority: String,
	/// Stable id the agent generates once at process startup and reuses
	/// across every re-registration and retry of its own lifetime.
	pub node_id: Uuid,
	pub frontend_mode: FrontendMode,
	pub protocol: Protocol,
	pub hostname: String,
	pub use_tls: bool,
	pub api_port: u16,
	#[serde(default)]
	pub port_range: Option<Vec<u16>>,
	#[serde(default)]
	pub wildcard_domain: Option<String>,
	#[serde(default)]
	pub filtered_apps_only: bool,
	pub accepted_traffics: Vec<TrafficClass>,
	#[serde(default)]
	pub app_filters: Vec<AppFilter>,
}

/// `PUT /api/worker`: registers a worker agent, or re-registers an
/// existing authority and records its node id (for an HA pair behind the
/// same authority). Re-registering with a node id already on file, such as
/// an agent retrying a request that actually succeeded, leaves the node
/// set unchanged. Rejects a re-registration whose advertised capabilities
/// conflict with the existing record.
pub async fn put_worker(
	State(state): State<AppState>,
	_auth: WorkerAuth,
	Json(req): Json<WorkerRegisterRequest>,
) -> Result<Json<Worker>, ApiError> {
	let key = appproxy_store::keys::worker(&req.authority);
	let existing = appproxy_store::typed::get_typed::<Worker>(state.store.as_ref(), &key).await.map_err(super::store_err)?;
	let now = Utc::now();

	let worker = match existing {
		Some(prior) => {
			let mut node_ids = prior.node_ids.clone();
			node_ids.insert(req.node_id);
			let candidate = Worker {
				id: prior.id,
				authority: req.authority.clone().into(),
				frontend_mode: req.frontend_mode,
				protocol: req.protocol,
				hostname: req.hostname.clone().into(),
				use_tls: req.use_tls,
				api_port: req.api_port,
				port_range: req.port_range.clone(),
				wildcard_domain: req.wildcard_domain.clone().map(Into::into),
				filtered_apps_only: req.filtered_apps_only,
				accepted_traffics: req.accepted_traffics.clone(),
				app_filters: req.app_filters.clone(),
				created_at: prior.created_at,
				updated_at: now,
				node_ids,
			};
			if !prior.compatible_with(&candidate) {
				return Err(ApiError::new(
					appproxy_core::error::ErrorCode::WorkerRegistrationFailed,
					"re-registration conflicts with the existing worker's capabilities",
				));
			}
			candidate
		},
		None => Worker {
			id: Uuid::new_v4(),
			authority: req.authority.clone().into(),
			frontend_mode: req.frontend_mode,
			protocol: req.protocol,
			hostname: req.hostname.clone().into(),
			use_tls: req.use_tls,
			api_port: req.api_port,
			port_range: req.port_range.clone(),
			wildcard_domain: req.wildcard_domain.clone().map(Into::into),
			filtered_apps_only: req.filtered_apps_only,
			accepted_traffics: req.accepted_traffics.clone(),
			app_filters: req.app_filters.clone(),
			created_at: now,
			updated_at: now,
			node_ids: BTreeSet::from([req.node_id]),
		},
	};

	appproxy_store::typed::put_typed(state.store.as_ref(), &key, &worker).await.map_err(super::store_err)?;
	state
		.bus
		.publish(appproxy_core::model::Event::WorkerRegistered { worker: worker.clone() })
		.await
		.map_err(super::store_err)?;
	Ok(Json(worker))
}

pub async fn get_workers(State(state): State<AppState>, _auth: WorkerAuth) -> Result<Json<Vec<Worker>>, ApiError> {
	let rows = appproxy_store::typed::list_typed::<Worker>(state.store.as_ref(), &appproxy_store::keys::workers_prefix())
		.await
		.map_err(super::store_err)?;
	Ok(Json(rows.into_iter().map(|(_, w)| w).collect()))
}

pub async fn get_worker(
	State(state): State<AppState>,
	_auth: WorkerAuth,
	Path(authority): Path<String>,
) -> Result<Json<Worker>, ApiError> {
	appproxy_store::typed::get_typed::<Worker>(state.store.as_ref(), &appproxy_store::keys::worker(&authority))
		.await
		.map_err(super::store_err)?
		.map(Json)
		.ok_or_else(|| ApiError::not_found("worker"))
}

#[derive(Debug, Deserialize)]
pub struct WorkerPatchRequest {
	pub filtered_apps_only: Option<bool>,
	pub accepted_traffics: Option<Vec<TrafficClass>>,
	pub app_filters: Option<Vec<AppFilter>>,
}

/// `PATCH /api/worker/{authority}`: updates the mutable policy fields of
/// an existing worker record without touching its capacity or transport.
pub async fn patch_worker(
	State(state): State<AppState>,
	_auth: WorkerAuth,
	Path(authority): Path<String>,
	Json(patch): Json<WorkerPatchRequest>,
) -> Result<Json<Worker>, ApiError> {
	let key = appproxy_store::keys::worker(&authority);
	let mut worker = appproxy_store::typed::get_typed::<Worker>(state.store.as_ref(), &key)
		.await
		.map_err(super::store_err)?
		.ok_or_else(|| ApiError::not_found("worker"))?;

	if let Some(v) = patch.filtered_apps_only {
		worker.filtered_apps_only = v;
	}
	if let Some(v) = patch.accepted_traffics {
		worker.accepted_traffics = v;
	}
	if let Some(v) = patch.app_filters {
		worker.app_filters = v;
	}
	worker.updated_at = Utc::now();

	appproxy_store::typed::put_typed(state.store.as_ref(), &key, &worker).await.map_err(super::store_err)?;
	Ok(Json(worker))
}

/// `DELETE /api/worker/{authority}`: deregisters a worker and clears its
/// slot table. Circuits already bound to it are left in place; the worker
/// agent is expected to have torn them down before calling this.
pub async fn delete_worker(
	State(state): State<AppState>,
	_auth: WorkerAuth,
	Path(authority): Path<String>,
) -> Result<StatusCode, ApiError> {
	let existed = appproxy_store::typed::get_typed::<Worker>(state.store.as_ref(), &appproxy_store::keys::worker(&authority))
		.await
		.map_err(super::store_err)?
		.ok_or_else(|| ApiError::not_found("worker"))?;

	state.store.delete(&appproxy_store::keys::worker(&authority)).await.map_err(super::store_err)?;
	let slots = state.store.list_prefix(&appproxy_store::keys::slots_prefix(&authority)).await.map_err(super::store_err)?;
	for (key, _) in slots {
		state.store.delete(&key).await.map_err(super::store_err)?;
	}
	state.bus.publish(appproxy_core::model::Event::WorkerRemoved { authority: existed.authority.clone() }).await.map_err(super::store_err)?;
	Ok(StatusCode::NO_CONTENT)
}

pub async fn get_worker_circuits(
	State(state): State<AppState>,
	_auth: WorkerAuth,
	Path(authority): Path<String>,
) -> Result<Json<Vec<Circuit>>, ApiError> {
	Ok(Json(state.circuit_registry.list_by_worker(&authority).await.map_err(super::store_err)?))
}
