//! Admission policy pipeline: executed in a fixed order with
//! the first failure short-circuiting the request. All five checks are
//! in-process and non-suspending.

use std::net::IpAddr;

use appproxy_core::error::{ApiError, ErrorCode};
use appproxy_core::model::{ApiToken, AppMode, Circuit, Protocol};
use appproxy_store::kv::KvStore;
use appproxy_store::{keys, typed};
use async_trait::async_trait;
use http::HeaderMap;
use ipnet::IpNet;

const COOKIE_HEADER: &str = "cookie";
const AUTH_COOKIE_NAME: &str = "backendai-circuit-auth";

/// (1) CIDR check against `allowed_client_ips`. `peer` is the worker's
/// view of the connecting address; `trust_forwarded_for` opts into
/// honoring `X-Forwarded-For` instead, since a worker should only trust
/// that header when a configured reverse proxy sits in front of it.
pub fn check_client_ip(circuit: &Circuit, peer: IpAddr, headers: &HeaderMap, trust_forwarded_for: bool) -> Result<(), ApiError> {
	let Some(allowed) = circuit.allowed_client_ips.as_ref() else { return Ok(()) };
	if allowed.is_empty() {
		return Ok(());
	}
	let candidate = if trust_forwarded_for {
		forwarded_for(headers).unwrap_or(peer)
	} else {
		peer
	};
	if allowed.iter().any(|cidr: &IpNet| cidr.contains(&candidate)) {
		Ok(())
	} else {
		Err(ApiError::new(
			ErrorCode::ClientIpNotAllowed,
			format!("client address {candidate} is not in the circuit's allowed CIDR list"),
		))
	}
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
	headers.get("x-forwarded-for")?.to_str().ok()?.split(',').next()?.trim().parse().ok()
}

/// (2) interactive cookie check.
pub fn check_interactive_cookie(circuit: &Circuit, headers: &HeaderMap) -> Result<(), ApiError> {
	if circuit.open_to_public {
		return Ok(());
	}
	let Some(secret) = circuit.auth_secret.as_ref() else { return Ok(()) };
	let Some(found) = read_cookie(headers, AUTH_COOKIE_NAME) else {
		return Err(ApiError::new(ErrorCode::MissingCookie, "missing circuit authorization cookie"));
	};
	if found == secret.as_str() {
		Ok(())
	} else {
		Err(ApiError::new(ErrorCode::InvalidCookie, "circuit authorization cookie does not match"))
	}
}

fn read_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
	let raw = headers.get(COOKIE_HEADER)?.to_str().ok()?;
	raw.split(';').map(str::trim).find_map(|kv| {
		let (k, v) = kv.split_once('=')?;
		(k == name).then_some(v)
	})
}

/// (3) inference bearer-token check, verified locally against the store
/// without a coordinator round-trip.
pub async fn check_inference_token(
	circuit: &Circuit,
	headers: &HeaderMap,
	vault: &dyn TokenVerifier,
) -> Result<(), ApiError> {
	if circuit.open_to_public {
		return Ok(());
	}
	let Some(endpoint_id) = circuit.endpoint_id else { return Ok(()) };
	let Some(raw) = headers.get(http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
		return Err(ApiError::new(ErrorCode::MissingAuthToken, "missing Authorization header"));
	};
	let Some(token) = raw.strip_prefix("BackendAI ") else {
		return Err(ApiError::new(ErrorCode::InvalidAuthScheme, "Authorization scheme must be 'BackendAI'"));
	};
	if vault.verify(token, endpoint_id).await {
		Ok(())
	} else {
		Err(ApiError::new(ErrorCode::InvalidAuthToken, "endpoint API token is invalid, expired, or revoked"))
	}
}

/// Local trait seam so admission can be unit-tested without a live store;
/// the worker's production verifier round-trips to the coordinator-shared
/// store (no coordinator RPC needed).
#[async_trait]
pub trait TokenVerifier: Send + Sync {
	async fn verify(&self, token: &str, endpoint_id: uuid::Uuid) -> bool;
}

/// Production verifier: reads `coordinator/tokens/api/{token}` directly
/// from the shared store, matching the coordinator's own `TokenVault`
/// read path with no RPC to the coordinator at all.
pub struct StoreTokenVerifier {
	pub store: std::sync::Arc<dyn KvStore>,
}

#[async_trait]
impl TokenVerifier for StoreTokenVerifier {
	async fn verify(&self, token: &str, endpoint_id: uuid::Uuid) -> bool {
		match typed::get_typed::<ApiToken>(self.store.as_ref(), &keys::api_token(token)).await {
			Ok(Some(record)) => record.endpoint_id == endpoint_id && !record.is_expired(),
			Ok(None) => false,
			Err(err) => {
				tracing::warn!(error = %err, "api token lookup failed");
				false
			},
		}
	}
}

/// (4) mode consistency: a request carrying inference-style credentials
/// against an interactive circuit, or interactive-style credentials
/// against an inference circuit, is rejected rather than silently
/// admitted under the wrong policy.
pub fn check_mode_consistency(circuit: &Circuit, headers: &HeaderMap) -> Result<(), ApiError> {
	let has_cookie = read_cookie(headers, AUTH_COOKIE_NAME).is_some();
	let has_bearer = headers.get(http::header::AUTHORIZATION).is_some();
	match circuit.app_mode {
		AppMode::Interactive if has_bearer && !has_cookie => Err(ApiError::new(
			ErrorCode::ModeMismatchInference,
			"inference-style Authorization header presented against an interactive circuit",
		)),
		AppMode::Inference if has_cookie && !has_bearer => Err(ApiError::new(
			ErrorCode::ModeMismatchInteractive,
			"interactive-style cookie presented against an inference circuit",
		)),
		_ => Ok(()),
	}
}

/// (5) protocol compatibility: interactive apps may not launch over
/// `grpc`/`h2`.
pub fn check_protocol_compatibility(circuit: &Circuit) -> Result<(), ApiError> {
	if circuit.app_mode == AppMode::Interactive && matches!(circuit.protocol, Protocol::Grpc | Protocol::H2) {
		return Err(ApiError::new(ErrorCode::ProtocolMismatch, "interactive apps cannot run over grpc or h2"));
	}
	Ok(())
}

/// Runs the full pipeline in fixed order, short-circuiting on first
/// failure.
pub async fn admit(
	circuit: &Circuit,
	peer: IpAddr,
	headers: &HeaderMap,
	trust_forwarded_for: bool,
	vault: &dyn TokenVerifier,
) -> Result<(), ApiError> {
	check_client_ip(circuit, peer, headers, trust_forwarded_for)?;
	check_interactive_cookie(circuit, headers)?;
	check_inference_token(circuit, headers, vault).await?;
	check_mode_consistency(circuit, headers)?;
	check_protocol_compatibility(circuit)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use appproxy_core::model::{FrontendMode, RouteInfo};
	use chrono::Utc;
	use test_case::test_case;
	use uuid::Uuid;

	use super::*;

	struct AlwaysValid;
	#[async_trait]
	impl TokenVerifier for AlwaysValid {
		async fn verify(&self, _token: &str, _endpoint_id: Uuid) -> bool {
			true
		}
	}
	struct AlwaysInvalid;
	#[async_trait]
	impl TokenVerifier for AlwaysInvalid {
		async fn verify(&self, _token: &str, _endpoint_id: Uuid) -> bool {
			false
		}
	}

	fn base_circuit(app_mode: AppMode) -> Circuit {
		Circuit {
			id: Uuid::new_v4(),
			app: "jupyter".into(),
			protocol: Protocol::Http,
			worker: "w1".into(),
			app_mode,
			frontend_mode: FrontendMode::Port,
			envs: Default::default(),
			arguments: None,
			open_to_public: false,
			allowed_client_ips: None,
			port: Some(10205),
			subdomain: None,
			user_id: Some(Uuid::new_v4()),
			endpoint_id: Some(Uuid::new_v4()),
			route_info: vec![RouteInfo {
				session_id: Uuid::new_v4(),
				session_name: None,
				kernel_host: "k".into(),
				kernel_port: 8080,
				protocol: Protocol::Http,
				traffic_ratio: 1.0,
			}],
			session_ids: vec![],
			auth_secret: Some("s3cr3t".into()),
			created_at: Utc::now(),
			updated_at: Utc::now(),
		}
	}

	fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
		let mut headers = HeaderMap::new();
		for (k, v) in pairs {
			headers.insert(http::HeaderName::from_bytes(k.as_bytes()).unwrap(), v.parse().unwrap());
		}
		headers
	}

	#[test]
	fn interactive_missing_cookie_is_rejected() {
		let circuit = base_circuit(AppMode::Interactive);
		let err = check_interactive_cookie(&circuit, &HeaderMap::new()).unwrap_err();
		assert_eq!(err.code, ErrorCode::MissingCookie);
	}

	#[test]
	fn interactive_wrong_cookie_is_rejected() {
		let circuit = base_circuit(AppMode::Interactive);
		let headers = headers_with(&[("cookie", "backendai-circuit-auth=wrong")]);
		let err = check_interactive_cookie(&circuit, &headers).unwrap_err();
		assert_eq!(err.code, ErrorCode::InvalidCookie);
	}

	#[test]
	fn interactive_correct_cookie_is_admitted() {
		let circuit = base_circuit(AppMode::Interactive);
		let headers = headers_with(&[("cookie", "backendai-circuit-auth=s3cr3t")]);
		assert!(check_interactive_cookie(&circuit, &headers).is_ok());
	}

	#[test]
	fn open_to_public_interactive_skips_cookie_check() {
		let mut circuit = base_circuit(AppMode::Interactive);
		circuit.open_to_public = true;
		assert!(check_interactive_cookie(&circuit, &HeaderMap::new()).is_ok());
	}

	#[tokio::test]
	async fn inference_missing_auth_header_is_rejected() {
		let circuit = base_circuit(AppMode::Inference);
		let err = check_inference_token(&circuit, &HeaderMap::new(), &AlwaysValid).await.unwrap_err();
		assert_eq!(err.code, ErrorCode::MissingAuthToken);
	}

	#[tokio::test]
	async fn inference_wrong_scheme_is_rejected() {
		let circuit = base_circuit(AppMode::Inference);
		let headers = headers_with(&[("authorization", "Bearer abc")]);
		let err = check_inference_token(&circuit, &headers, &AlwaysValid).await.unwrap_err();
		assert_eq!(err.code, ErrorCode::InvalidAuthScheme);
	}

	#[tokio::test]
	async fn inference_invalid_token_is_rejected() {
		let circuit = base_circuit(AppMode::Inference);
		let headers = headers_with(&[("authorization", "BackendAI t1")]);
		let err = check_inference_token(&circuit, &headers, &AlwaysInvalid).await.unwrap_err();
		assert_eq!(err.code, ErrorCode::InvalidAuthToken);
	}

	#[tokio::test]
	async fn inference_valid_token_is_admitted() {
		let circuit = base_circuit(AppMode::Inference);
		let headers = headers_with(&[("authorization", "BackendAI t1")]);
		assert!(check_inference_token(&circuit, &headers, &AlwaysValid).await.is_ok());
	}

	#[test_case(Protocol::Http, false; "http is fine")]
	#[test_case(Protocol::Grpc, true; "grpc is rejected")]
	#[test_case(Protocol::H2, true; "h2 is rejected")]
	fn interactive_protocol_compatibility(protocol: Protocol, should_reject: bool) {
		let mut circuit = base_circuit(AppMode::Interactive);
		circuit.protocol = protocol;
		let result = check_protocol_compatibility(&circuit);
		assert_eq!(result.is_err(), should_reject);
	}

	#[test]
	fn inference_bearer_against_interactive_circuit_is_mode_mismatch() {
		let circuit = base_circuit(AppMode::Interactive);
		let headers = headers_with(&[("authorization", "BackendAI t1")]);
		let err = check_mode_consistency(&circuit, &headers).unwrap_err();
		assert_eq!(err.code, ErrorCode::ModeMismatchInference);
	}

	#[test]
	fn interactive_cookie_against_inference_circuit_is_mode_mismatch() {
		let circuit = base_circuit(AppMode::Inference);
		let headers = headers_with(&[("cookie", "backendai-circuit-auth=s3cr3t")]);
		let err = check_mode_consistency(&circuit, &headers).unwrap_err();
		assert_eq!(err.code, ErrorCode::ModeMismatchInteractive);
	}
}
