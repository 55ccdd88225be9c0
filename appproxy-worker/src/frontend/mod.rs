//! Proxy Frontend: one `TcpListener` per reserved port for
//! `frontend_mode = port`, or a single SNI-dispatching HTTPS listener for
//! `frontend_mode = wildcard`. Every accepted connection resolves to a
//! [`SlotKey`], which in turn resolves to a live [`Circuit`] (or the
//! connection is rejected) before traffic moves.

pub mod http;
pub mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;

use appproxy_core::model::{FrontendMode, Protocol, SlotKey};
use arcstr::ArcStr;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TlsConfig;
use crate::state::AppState;
use self::http::HttpFrontend;

#[derive(Clone)]
pub struct Frontend {
	state: AppState,
	http: Arc<HttpFrontend>,
	tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
}

impl Frontend {
	pub fn new(state: AppState) -> anyhow::Result<Self> {
		let tls_acceptor = match (&state.config.tls, state.config.use_tls) {
			(Some(tls), true) => Some(tokio_rustls::TlsAcceptor::from(load_tls_config(tls)?)),
			_ => None,
		};
		let http = Arc::new(HttpFrontend::new(state.clone()));
		Ok(Self { state, http, tls_acceptor })
	}

	pub async fn serve(&self, cancel: CancellationToken) -> anyhow::Result<()> {
		match self.state.config.frontend_mode {
			FrontendMode::Port => self.serve_port(cancel).await,
			FrontendMode::Wildcard => self.serve_wildcard(cancel).await,
		}
	}

	async fn serve_port(&self, cancel: CancellationToken) -> anyhow::Result<()> {
		let ports = self.state.config.port_range.clone().unwrap_or_default();
		let mut set = JoinSet::new();
		for port in ports {
			let listener = TcpListener::bind(("0.0.0.0", port)).await?;
			info!(port, "port frontend listening");
			let this = self.clone();
			let cancel = cancel.clone();
			set.spawn(async move { this.accept_loop(listener, SlotKey::Port(port), cancel).await });
		}
		while let Some(result) = set.join_next().await {
			result??;
		}
		Ok(())
	}

	async fn serve_wildcard(&self, cancel: CancellationToken) -> anyhow::Result<()> {
		let Some(domain) = self.state.config.wildcard_domain.clone() else {
			anyhow::bail!("frontend_mode = wildcard requires wildcard_domain");
		};
		if self.tls_acceptor.is_none() {
			anyhow::bail!("frontend_mode = wildcard requires use_tls = true and a [tls] section");
		}
		let listener = TcpListener::bind(("0.0.0.0", self.state.config.wildcard_listen_port)).await?;
		info!(port = self.state.config.wildcard_listen_port, domain = %domain, "wildcard frontend listening");
		loop {
			tokio::select! {
				_ = cancel.cancelled() => return Ok(()),
				accepted = listener.accept() => {
					let (stream, peer) = accepted?;
					let this = self.clone();
					let domain = domain.clone();
					tokio::spawn(async move { this.handle_wildcard_connection(stream, peer, &domain).await });
				}
			}
		}
	}

	async fn accept_loop(&self, listener: TcpListener, key: SlotKey, cancel: CancellationToken) -> anyhow::Result<()> {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => return Ok(()),
				accepted = listener.accept() => {
					let (stream, peer) = accepted?;
					let this = self.clone();
					let key = key.clone();
					tokio::spawn(async move { this.handle_port_connection(stream, peer, key).await });
				}
			}
		}
	}

	async fn handle_port_connection(&self, stream: TcpStream, peer: SocketAddr, key: SlotKey) {
		let Some(circuit) = self.state.table.get_by_key(&key).await else {
			warn!(key = %key, "connection to unbound slot rejected");
			return;
		};
		if circuit.protocol.is_http_family() {
			match (&self.tls_acceptor, self.state.config.use_tls) {
				(Some(acceptor), true) => match acceptor.accept(stream).await {
					Ok(tls_stream) => self.http.serve_connection(tls_stream, peer, key).await,
					Err(err) => warn!(error = %err, "tls handshake failed on port frontend"),
				},
				_ => self.http.serve_connection(stream, peer, key).await,
			}
		} else {
			if let Err(err) = crate::admission::check_client_ip(&circuit, peer.ip(), &::http::HeaderMap::new(), self.state.config.trust_forwarded_for) {
				warn!(circuit_id = %circuit.id, error = %err, "tcp tunnel rejected by admission");
				return;
			}
			self.state.table.mark_accessed(circuit.id).await;
			tcp::run_tunnel(stream, circuit, self.state.pool.clone(), self.state.metrics.clone()).await;
		}
	}

	async fn handle_wildcard_connection(&self, stream: TcpStream, peer: SocketAddr, domain: &str) {
		let acceptor = self.tls_acceptor.as_ref().expect("checked in serve_wildcard");
		let tls_stream = match acceptor.accept(stream).await {
			Ok(s) => s,
			Err(err) => {
				warn!(error = %err, "tls handshake failed on wildcard frontend");
				return;
			},
		};
		let sni = tls_stream.get_ref().1.server_name().map(str::to_string);
		let Some(subdomain) = sni.and_then(|name| subdomain_label(&name, domain)) else {
			warn!(peer = %peer, "wildcard connection with no matching SNI");
			return;
		};
		let key = SlotKey::Subdomain(ArcStr::from(subdomain));
		let Some(circuit) = self.state.table.get_by_key(&key).await else {
			warn!(key = %key, "wildcard connection to unbound subdomain rejected");
			return;
		};
		if circuit.protocol == Protocol::Tcp {
			warn!(key = %key, "raw tcp circuits are not served on the wildcard frontend");
			return;
		}
		self.http.serve_connection(tls_stream, peer, key).await;
	}
}

fn subdomain_label(sni: &str, wildcard_domain: &str) -> Option<String> {
	sni.strip_suffix(&format!(".{wildcard_domain}")).map(str::to_string)
}

fn load_tls_config(tls: &TlsConfig) -> anyhow::Result<Arc<ServerConfig>> {
	let cert_bytes = std::fs::read(&tls.cert_path)?;
	let key_bytes = std::fs::read(&tls.key_path)?;
	let certs: Vec<CertificateDer<'static>> =
		rustls_pemfile::certs(&mut cert_bytes.as_slice()).collect::<Result<_, _>>()?;
	let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_bytes.as_slice())?
		.ok_or_else(|| anyhow::anyhow!("no private key found in {:?}", tls.key_path))?;
	let provider = Arc::new(rustls::crypto::ring::default_provider());
	let config = ServerConfig::builder_with_provider(provider)
		.with_safe_default_protocol_versions()?
		.with_no_client_auth()
		.with_single_cert(certs, key)?;
	Ok(Arc::new(config))
}
