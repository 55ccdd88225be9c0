//! Backend connection pool: a `flurry::HashMap` of per-key semaphores
//! caps how many connections a single backend may have open at once, so
//! a burst of requests to one kernel can't unbounded-spawn sockets.
//! There is no idle-connection reuse here — raw-`tcp` circuits hold
//! their backend socket exclusively for the tunnel's lifetime
//! (`frontend/tcp.rs`), and HTTP(S)/h2/grpc keep-alive reuse is
//! `hyper_util`'s own client-pool job (`frontend/http.rs`) — so this
//! pool only ever dials fresh sockets, gated by capacity.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BackendKey {
	pub host: String,
	pub port: u16,
}

impl BackendKey {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self { host: host.into(), port }
	}

	fn hash_u64(&self) -> u64 {
		let mut hasher = DefaultHasher::new();
		self.hash(&mut hasher);
		hasher.finish()
	}
}

/// A checked-out backend socket. Holding it accounts for one unit of the
/// key's capacity; dropping it releases the capacity immediately.
pub struct PooledStream {
	pub stream: TcpStream,
	key: BackendKey,
	_permit: OwnedSemaphorePermit,
}

impl PooledStream {
	pub fn key(&self) -> &BackendKey {
		&self.key
	}
}

pub struct BackendPool {
	permits: flurry::HashMap<u64, Arc<Semaphore>>,
	max_per_key: usize,
}

impl BackendPool {
	pub fn new(max_per_key: usize) -> Self {
		Self { permits: flurry::HashMap::new(), max_per_key }
	}

	fn semaphore_for(&self, hash: u64) -> Arc<Semaphore> {
		let guard = self.permits.guard();
		if let Some(sem) = self.permits.get(&hash, &guard) {
			return sem.clone();
		}
		let sem = Arc::new(Semaphore::new(self.max_per_key));
		match self.permits.try_insert(hash, sem.clone(), &guard) {
			Ok(_) => sem,
			// Lost the race to insert; use whichever semaphore won.
			Err(e) => e.current.clone(),
		}
	}

	/// Dials a fresh connection to `key`. Always blocks until capacity
	/// for `key` is available, bounding the number of sockets any single
	/// backend can accumulate under load.
	pub async fn checkout(&self, key: &BackendKey) -> anyhow::Result<PooledStream> {
		let hash = key.hash_u64();
		let permit = self.semaphore_for(hash).acquire_owned().await?;

		debug!(host = %key.host, port = key.port, "dialing new backend connection");
		let stream = TcpStream::connect((key.host.as_str(), key.port)).await?;
		apply_keepalive(&stream)?;
		Ok(PooledStream { stream, key: key.clone(), _permit: permit })
	}
}

fn apply_keepalive(stream: &TcpStream) -> anyhow::Result<()> {
	let sock = SockRef::from(stream);
	let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60)).with_interval(Duration::from_secs(15));
	sock.set_tcp_keepalive(&keepalive)?;
	Ok(())
}
