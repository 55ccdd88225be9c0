//! Raw-`tcp` circuit handling: a dialed backend socket is exclusive to
//! one client tunnel for its lifetime. Accept, resolve the backend
//! route, then copy bytes bidirectionally until either side closes.

use std::sync::Arc;

use appproxy_core::model::Circuit;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::inference_router;
use crate::pool::{BackendKey, BackendPool};
use crate::telemetry::Metrics;

/// Picks the backend for a tcp circuit: the sampled route for inference,
/// the sole route for interactive.
fn backend_key(circuit: &Circuit) -> Option<BackendKey> {
	use appproxy_core::model::AppMode;
	let route = match circuit.app_mode {
		AppMode::Inference => inference_router::select_route(&circuit.route_info, &mut rand::rng())?,
		AppMode::Interactive => circuit.route_info.first()?,
	};
	Some(BackendKey::new(route.kernel_host.as_str(), route.kernel_port))
}

pub async fn run_tunnel(client: TcpStream, circuit: Circuit, pool: Arc<BackendPool>, metrics: Arc<Metrics>) {
	let Some(key) = backend_key(&circuit) else {
		warn!(circuit_id = %circuit.id, "tcp circuit has no usable route");
		return;
	};

	let mut pooled = match pool.checkout(&key).await {
		Ok(pooled) => pooled,
		Err(err) => {
			metrics.backend_connect_failed.inc();
			warn!(circuit_id = %circuit.id, host = %key.host, port = key.port, error = %err, "failed to dial tcp backend");
			return;
		},
	};

	debug!(circuit_id = %circuit.id, host = %key.host, port = key.port, "tcp tunnel established");
	let mut client = client;
	match tokio::io::copy_bidirectional(&mut client, &mut pooled.stream).await {
		Ok((to_backend, to_client)) => {
			debug!(circuit_id = %circuit.id, to_backend, to_client, "tcp tunnel closed");
		},
		Err(err) => {
			debug!(circuit_id = %circuit.id, error = %err, "tcp tunnel ended with an error");
		},
	}
	// Exclusive per tunnel: never checked back in, just dropped.
}
