//! HTTP(S)/h2/grpc reverse proxy. Incoming request bodies are forwarded
//! to the backend unbuffered (`hyper::body::Incoming` passed straight
//! through); keep-alive reuse of the backend connection is `hyper_util`'s
//! own client-pool job, kept separate from the raw-socket capacity pool
//! in `pool.rs` (see DESIGN.md).

use std::net::SocketAddr;
use std::sync::Arc;

use appproxy_core::error::{ApiError, ErrorCode};
use appproxy_core::model::{Circuit, Protocol, SlotKey};
use http::Uri;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::debug;

use crate::admission::{self, StoreTokenVerifier};
use crate::inference_router;
use crate::state::AppState;

#[derive(Clone)]
pub struct HttpFrontend {
	state: AppState,
	h1_client: Client<HttpConnector, Incoming>,
	h2_client: Client<HttpConnector, Incoming>,
}

impl HttpFrontend {
	pub fn new(state: AppState) -> Self {
		let h1_client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
		let h2_client = Client::builder(TokioExecutor::new()).http2_only(true).build(HttpConnector::new());
		Self { state, h1_client, h2_client }
	}

	/// Serves one accepted connection, dispatching every request on it
	/// against the circuit currently bound to `key`. A fresh lookup runs
	/// per request so an install/uninstall mid-connection takes effect
	/// without requiring the client to reconnect.
	pub async fn serve_connection<IO>(&self, io: IO, peer: SocketAddr, key: SlotKey)
	where
		IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
	{
		let this = self.clone();
		let key = key.clone();
		let service = service_fn(move |req| {
			let this = this.clone();
			let key = key.clone();
			async move { Ok::<_, std::convert::Infallible>(this.handle(peer, &key, req).await) }
		});
		let io = TokioIo::new(io);
		if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
			.serve_connection_with_upgrades(io, service)
			.await
		{
			debug!(peer = %peer, error = %err, "http connection ended with an error");
		}
	}

	async fn handle(
		&self,
		peer: SocketAddr,
		key: &SlotKey,
		req: hyper::Request<Incoming>,
	) -> axum::response::Response {
		match self.try_handle(peer, key, req).await {
			Ok(resp) => resp,
			Err(err) => {
				self.state.metrics.admission_rejected.get_or_create(&crate::telemetry::AdmissionLabels { code: err.code.as_str() }).inc();
				axum::response::IntoResponse::into_response(err)
			},
		}
	}

	async fn try_handle(
		&self,
		peer: SocketAddr,
		key: &SlotKey,
		req: hyper::Request<Incoming>,
	) -> Result<axum::response::Response, ApiError> {
		let circuit = self.state.table.get_by_key(key).await.ok_or_else(|| match key {
			SlotKey::Subdomain(_) => ApiError::new(ErrorCode::UnknownSubdomain, "no circuit bound to this subdomain"),
			SlotKey::Port(_) => ApiError::not_found("no circuit bound to this port"),
		})?;

		let verifier = StoreTokenVerifier { store: self.state.store.clone() };
		admission::admit(&circuit, peer.ip(), req.headers(), self.state.config.trust_forwarded_for, &verifier).await?;

		self.state.table.mark_accessed(circuit.id).await;

		let route = select_route(&circuit).ok_or_else(|| ApiError::new(ErrorCode::BackendDied, "no live backend route for this circuit"))?;
		self.state.metrics.inference_route_selected.get_or_create(&crate::telemetry::RouteLabels { session_id: route.session_id.to_string() }).inc();

		let outbound = rewrite_uri(req, &route.kernel_host, route.kernel_port)?;
		let client = self.client_for(circuit.protocol);
		let resp = client.request(outbound).await.map_err(|err| {
			self.state.metrics.backend_connect_failed.inc();
			ApiError::new(ErrorCode::BackendDied, format!("backend request failed: {err}"))
		})?;
		Ok(resp.map(axum::body::Body::new))
	}

	fn client_for(&self, protocol: Protocol) -> &Client<HttpConnector, Incoming> {
		match protocol {
			Protocol::Grpc | Protocol::H2 => &self.h2_client,
			_ => &self.h1_client,
		}
	}
}

fn select_route(circuit: &Circuit) -> Option<&appproxy_core::model::RouteInfo> {
	use appproxy_core::model::AppMode;
	match circuit.app_mode {
		AppMode::Inference => inference_router::select_route(&circuit.route_info, &mut rand::rng()),
		AppMode::Interactive => circuit.route_info.first(),
	}
}

fn rewrite_uri(req: hyper::Request<Incoming>, host: &str, port: u16) -> Result<hyper::Request<Incoming>, ApiError> {
	let (mut parts, body) = req.into_parts();
	let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
	let new_uri: Uri = format!("http://{host}:{port}{path_and_query}")
		.parse()
		.map_err(|_| ApiError::internal("failed to build backend URI"))?;
	parts.uri = new_uri;
	parts.headers.insert(http::header::HOST, format!("{host}:{port}").parse().map_err(|_| ApiError::internal("invalid host header"))?);
	Ok(hyper::Request::from_parts(parts, body))
}
