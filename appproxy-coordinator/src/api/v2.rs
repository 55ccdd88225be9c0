//! Manager-facing surface: confirmation issuance, interactive
//! handoff, and inference endpoint lifecycle.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use appproxy_core::error::{ApiError, ErrorCode};
use appproxy_core::fingerprint::Fingerprint;
use appproxy_core::model::{AppMode, Circuit, ConfirmationToken, Endpoint, FrontendMode, Protocol, RouteInfo, SlotKey, TrafficClass, Worker};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use chrono::Utc;
use ipnet::IpNet;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::authn::ManagerAuth;
use crate::circuit_registry::CreateOutcome;
use crate::state::AppState;
use crate::worker_selector::SelectionRequest;

#[derive(Debug, Deserialize)]
pub struct ConfSessionInfo {
	pub user_uuid: Uuid,
	pub group_id: Uuid,
	#[serde(default = "default_domain")]
	pub domain_name: String,
	#[serde(default)]
	pub access_key: String,
}

fn default_domain() -> String {
	"default".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ConfRequest {
	pub kernel_host: String,
	pub kernel_port: u16,
	pub session: ConfSessionInfo,
	#[serde(default)]
	pub login_session_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConfResponse {
	pub token: String,
}

/// `POST /v2/conf`: mints a one-shot confirmation token the Manager hands
/// back to the end-user's browser for the interactive handoff.
pub async fn post_conf(
	State(state): State<AppState>,
	_auth: ManagerAuth,
	Json(req): Json<ConfRequest>,
) -> Result<Json<ConfResponse>, ApiError> {
	let ttl = Duration::from_secs(state.config.confirmation_token_ttl_secs);
	let token = state
		.token_vault
		.issue_confirmation(
			req.session.user_uuid,
			req.session.group_id,
			&req.session.access_key,
			&req.session.domain_name,
			&req.kernel_host,
			req.kernel_port,
			req.login_session_token,
			ttl,
		)
		.await
		.map_err(super::store_err)?;
	Ok(Json(ConfResponse { token: token.token.to_string() }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyAuthRequest {
	pub token: String,
	pub app: String,
	pub protocol: Protocol,
	pub session_id: Uuid,
	#[serde(default)]
	pub envs: HashMap<String, String>,
	#[serde(default)]
	pub open_to_public: bool,
	#[serde(default)]
	pub arguments: Option<String>,
	#[serde(default)]
	pub allowed_client_ips: Option<Vec<IpNet>>,
	#[serde(default)]
	pub no_reuse: bool,
	#[serde(default)]
	pub preferred_port: Option<u16>,
	#[serde(default)]
	pub preferred_subdomain: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProxyAuthResponse {
	pub redirect_url: String,
	pub reuse: bool,
}

enum ProxyAuthReply {
	Json(ProxyAuthResponse),
	Redirect(String),
}

impl IntoResponse for ProxyAuthReply {
	fn into_response(self) -> Response {
		match self {
			ProxyAuthReply::Json(body) => Json(body).into_response(),
			ProxyAuthReply::Redirect(url) => Redirect::to(&url).into_response(),
		}
	}
}

fn wants_json(headers: &HeaderMap) -> bool {
	headers
		.get(axum::http::header::ACCEPT)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.contains("application/json"))
}

/// `GET /v2/proxy/auth`: redeems a confirmation token, then reuses a live
/// interactive circuit with a matching fingerprint or provisions a new one
///. Responds with a redirect or a JSON body depending on
/// the caller's `Accept` header, matching the legacy Manager's two calling
/// conventions.
pub async fn get_proxy_auth(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(req): Json<ProxyAuthRequest>,
) -> Result<ProxyAuthReply, ApiError> {
	let confirmation = state
		.token_vault
		.redeem_confirmation(&req.token)
		.await
		.map_err(super::store_err)?
		.ok_or_else(|| ApiError::not_found("confirmation token"))?;

	let fingerprint_digest = if req.no_reuse {
		None
	} else {
		Some(
			Fingerprint {
				user_id: confirmation.user_id,
				app: req.app.clone(),
				kernel_host: confirmation.kernel_host.to_string(),
				kernel_port: confirmation.kernel_port,
				protocol: req.protocol,
				envs: req.envs.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<BTreeMap<_, _>>(),
				arguments: req.arguments.clone(),
				open_to_public: req.open_to_public,
				allowed_client_ips: req.allowed_client_ips.clone(),
				preferred_port: req.preferred_port,
				preferred_subdomain: req.preferred_subdomain.clone(),
			}
			.digest(),
		)
	};

	if let Some(digest) = &fingerprint_digest {
		if let Some(circuit) = state.circuit_registry.find_reusable(digest).await.map_err(super::store_err)? {
			let worker = load_worker(&state, &circuit.worker).await?;
			return Ok(reply(&headers, circuit_url(&worker, &circuit), true));
		}
	}

	let preferred_port_key = req.preferred_port.map(SlotKey::Port);
	let preferred_subdomain_key = req.preferred_subdomain.clone().map(|s| SlotKey::Subdomain(s.into()));
	let worker =
		select_interactive_worker(&state, &req, preferred_port_key.as_ref(), preferred_subdomain_key.as_ref()).await?;

	let worker_for_build = worker.clone();
	let req_for_build = req.clone();
	let confirmation_for_build = confirmation.clone();
	let build = move || build_interactive_circuit(&req_for_build, &worker_for_build, &confirmation_for_build);

	let outcome =
		state.circuit_registry.create_or_reuse(fingerprint_digest.as_deref(), build, &worker).await.map_err(super::registry_err)?;
	let (circuit, reused) = match outcome {
		CreateOutcome::Created(c) => (c, false),
		CreateOutcome::Reused(c) => (c, true),
	};
	Ok(reply(&headers, circuit_url(&worker, &circuit), reused))
}

fn reply(headers: &HeaderMap, redirect_url: String, reuse: bool) -> ProxyAuthReply {
	if wants_json(headers) {
		ProxyAuthReply::Json(ProxyAuthResponse { redirect_url, reuse })
	} else {
		ProxyAuthReply::Redirect(redirect_url)
	}
}

async fn load_worker(state: &AppState, authority: &str) -> Result<Worker, ApiError> {
	appproxy_store::typed::get_typed(state.store.as_ref(), &appproxy_store::keys::worker(authority))
		.await
		.map_err(super::store_err)?
		.ok_or_else(|| ApiError::not_found("worker"))
}

async fn select_interactive_worker(
	state: &AppState,
	req: &ProxyAuthRequest,
	preferred_port: Option<&SlotKey>,
	preferred_subdomain: Option<&SlotKey>,
) -> Result<Worker, ApiError> {
	for (mode, preferred) in [(FrontendMode::Port, preferred_port), (FrontendMode::Wildcard, preferred_subdomain)] {
		let selection = SelectionRequest {
			traffic_class: TrafficClass::Interactive,
			frontend_mode: mode,
			protocol: req.protocol,
			app: Some(req.app.as_str()),
			preferred_key: preferred,
		};
		if let Some(worker) = state.worker_selector.select(&selection).await.map_err(super::store_err)? {
			return Ok(worker);
		}
	}
	Err(ApiError::new(ErrorCode::NoWorkerAvailable, "no eligible worker for this request"))
}

fn build_interactive_circuit(req: &ProxyAuthRequest, worker: &Worker, confirmation: &ConfirmationToken) -> Circuit {
	let now = Utc::now();
	Circuit {
		id: Uuid::new_v4(),
		app: req.app.clone().into(),
		protocol: req.protocol,
		worker: worker.authority.clone(),
		app_mode: AppMode::Interactive,
		frontend_mode: worker.frontend_mode,
		envs: req.envs.clone(),
		arguments: req.arguments.clone(),
		open_to_public: req.open_to_public,
		allowed_client_ips: req.allowed_client_ips.clone(),
		port: req.preferred_port,
		subdomain: req.preferred_subdomain.clone().map(Into::into),
		user_id: Some(confirmation.user_id),
		endpoint_id: None,
		route_info: vec![RouteInfo {
			session_id: req.session_id,
			session_name: None,
			kernel_host: confirmation.kernel_host.clone(),
			kernel_port: confirmation.kernel_port,
			protocol: req.protocol,
			traffic_ratio: 1.0,
		}],
		session_ids: vec![req.session_id],
		auth_secret: if req.open_to_public { None } else { Some(generate_secret().into()) },
		created_at: now,
		updated_at: now,
	}
}

fn generate_secret() -> String {
	rand::rng().sample_iter(&Alphanumeric).map(char::from).take(32).collect()
}

fn circuit_url(worker: &Worker, circuit: &Circuit) -> String {
	match circuit.frontend_mode {
		FrontendMode::Port => {
			let scheme = if worker.use_tls { "https" } else { "http" };
			format!("{scheme}://{}:{}/", worker.hostname, circuit.port.unwrap_or_default())
		},
		FrontendMode::Wildcard => {
			let domain = worker.wildcard_domain.as_deref().unwrap_or(worker.hostname.as_str());
			format!("https://{}.{}/", circuit.subdomain.as_deref().unwrap_or_default(), domain)
		},
	}
}

#[derive(Debug, Serialize)]
pub struct LegacyProxyAliasResponse {
	pub redirect_url: &'static str,
}

/// `GET /v2/proxy/{token}/{session_id}/add`: the path-based calling
/// convention some older Manager versions still use. Always points the
/// caller at the body-based `/v2/proxy/auth` endpoint instead of
/// duplicating its logic.
pub async fn get_proxy_legacy_alias(
	Path((_token, _session_id)): Path<(String, Uuid)>,
) -> Json<LegacyProxyAliasResponse> {
	Json(LegacyProxyAliasResponse { redirect_url: "/v2/proxy/auth" })
}

#[derive(Debug, Deserialize)]
pub struct EndpointUpsertRequest {
	pub service_name: String,
	#[serde(default)]
	pub tags: HashMap<String, String>,
	/// app name -> kernel replicas backing it.
	pub apps: HashMap<String, Vec<RouteInfo>>,
	#[serde(default)]
	pub open_to_public: bool,
	#[serde(default)]
	pub preferred_port: Option<u16>,
	#[serde(default)]
	pub preferred_subdomain: Option<String>,
	#[serde(default)]
	pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct EndpointResponse {
	pub id: Uuid,
	pub circuit_id: Option<Uuid>,
}

/// `POST /v2/endpoints/{id}`: creates the endpoint's circuit on first call,
/// or atomically swaps `route_info` on every subsequent call.
pub async fn put_endpoint(
	State(state): State<AppState>,
	_auth: ManagerAuth,
	Path(id): Path<Uuid>,
	Json(req): Json<EndpointUpsertRequest>,
) -> Result<Json<EndpointResponse>, ApiError> {
	let existing = appproxy_store::typed::get_typed::<Endpoint>(state.store.as_ref(), &appproxy_store::keys::endpoint(&id.to_string()))
		.await
		.map_err(super::store_err)?;

	let route_info: Vec<RouteInfo> = req.apps.values().flat_map(|v| v.iter().cloned()).collect();
	let first_app = req.apps.keys().next().cloned().unwrap_or_default();

	let circuit_id = match existing.as_ref().and_then(|ep| ep.circuit_id) {
		Some(cid) => {
			state.circuit_registry.update_route_info(cid, route_info).await.map_err(super::registry_err)?;
			cid
		},
		None => {
			let worker = select_inference_worker(&state, &first_app, req.preferred_port, req.preferred_subdomain.as_deref())
				.await?;
			let open_to_public = req.open_to_public;
			let preferred_port = req.preferred_port;
			let preferred_subdomain = req.preferred_subdomain.clone();
			let route_info_for_build = route_info.clone();
			let worker_for_build = worker.clone();
			let endpoint_id = id;
			let build = move || Circuit {
				id: Uuid::new_v4(),
				app: Default::default(),
				protocol: worker_for_build.protocol,
				worker: worker_for_build.authority.clone(),
				app_mode: AppMode::Inference,
				frontend_mode: worker_for_build.frontend_mode,
				envs: HashMap::new(),
				arguments: None,
				open_to_public,
				allowed_client_ips: None,
				port: preferred_port,
				subdomain: preferred_subdomain.clone().map(Into::into),
				user_id: None,
				endpoint_id: Some(endpoint_id),
				route_info: route_info_for_build.clone(),
				session_ids: vec![],
				auth_secret: None,
				created_at: Utc::now(),
				updated_at: Utc::now(),
			};
			let outcome = state.circuit_registry.create_or_reuse(None, build, &worker).await.map_err(super::registry_err)?;
			match outcome {
				CreateOutcome::Created(c) | CreateOutcome::Reused(c) => c.id,
			}
		},
	};

	let endpoint = Endpoint {
		id,
		service_name: req.service_name.into(),
		tags: req.tags,
		apps: req.apps,
		open_to_public: req.open_to_public,
		preferred_port: req.preferred_port,
		preferred_subdomain: req.preferred_subdomain.map(Into::into),
		ttl_seconds: req.ttl_seconds,
		circuit_id: Some(circuit_id),
	};
	appproxy_store::typed::put_typed(state.store.as_ref(), &appproxy_store::keys::endpoint(&id.to_string()), &endpoint)
		.await
		.map_err(super::store_err)?;
	Ok(Json(EndpointResponse { id, circuit_id: Some(circuit_id) }))
}

async fn select_inference_worker(
	state: &AppState,
	app: &str,
	preferred_port: Option<u16>,
	preferred_subdomain: Option<&str>,
) -> Result<Worker, ApiError> {
	let port_selection = SelectionRequest {
		traffic_class: TrafficClass::Inference,
		frontend_mode: FrontendMode::Port,
		protocol: Protocol::Http,
		app: Some(app),
		preferred_key: preferred_port.map(SlotKey::Port).as_ref(),
	};
	if let Some(worker) = state.worker_selector.select(&port_selection).await.map_err(super::store_err)? {
		return Ok(worker);
	}
	let wildcard_selection = SelectionRequest {
		frontend_mode: FrontendMode::Wildcard,
		preferred_key: preferred_subdomain.map(|s| SlotKey::Subdomain(s.into())).as_ref(),
		..port_selection
	};
	state
		.worker_selector
		.select(&wildcard_selection)
		.await
		.map_err(super::store_err)?
		.ok_or_else(|| ApiError::new(ErrorCode::NoWorkerAvailable, "no eligible worker for this endpoint"))
}

/// `DELETE /v2/endpoints/{id}`: tears down the endpoint's circuit (if any)
/// and its record.
pub async fn delete_endpoint(
	State(state): State<AppState>,
	_auth: ManagerAuth,
	Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
	let Some(endpoint) =
		appproxy_store::typed::get_typed::<Endpoint>(state.store.as_ref(), &appproxy_store::keys::endpoint(&id.to_string()))
			.await
			.map_err(super::store_err)?
	else {
		return Err(ApiError::not_found("endpoint"));
	};
	if let Some(cid) = endpoint.circuit_id {
		match state.circuit_registry.remove(cid).await {
			Ok(_) | Err(crate::circuit_registry::RegistryError::NotFound) => {},
			Err(err) => return Err(super::registry_err(err)),
		}
	}
	state.store.delete(&appproxy_store::keys::endpoint(&id.to_string())).await.map_err(super::store_err)?;
	Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct IssueApiTokenRequest {
	pub user_uuid: Uuid,
	#[serde(default = "default_token_ttl_secs")]
	pub ttl_secs: i64,
}

fn default_token_ttl_secs() -> i64 {
	3600
}

#[derive(Debug, Serialize)]
pub struct ApiTokenResponse {
	pub token: String,
	pub exp: chrono::DateTime<Utc>,
}

/// `POST /v2/endpoints/{id}/token`: mints a bearer token authorizing calls
/// through a non-public inference endpoint.
pub async fn post_endpoint_token(
	State(state): State<AppState>,
	_auth: ManagerAuth,
	Path(id): Path<Uuid>,
	Json(req): Json<IssueApiTokenRequest>,
) -> Result<Json<ApiTokenResponse>, ApiError> {
	let exp = Utc::now() + chrono::Duration::seconds(req.ttl_secs);
	let token = state.token_vault.issue_api_token(id, req.user_uuid, exp).await.map_err(super::store_err)?;
	Ok(Json(ApiTokenResponse { token: token.token.to_string(), exp: token.exp }))
}
