use std::collections::{BTreeSet, HashMap};
use std::fmt;

use arcstr::ArcStr;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The two physical transports a worker's frontend can terminate on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontendMode {
	/// A pool of reserved TCP ports, one slot per port.
	Port,
	/// A single wildcard-subdomain HTTPS listener, unbounded slots.
	Wildcard,
}

/// The protocol a worker speaks to its backend kernels.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
	Http,
	Grpc,
	H2,
	Tcp,
}

impl Protocol {
	/// True for the HTTP-family protocols the wildcard/port HTTP reverse
	/// proxy paths handle; `Tcp` is raw byte copying instead.
	pub fn is_http_family(self) -> bool {
		matches!(self, Protocol::Http | Protocol::Grpc | Protocol::H2)
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
	Interactive,
	Inference,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AppFilter {
	pub key: String,
	pub value: String,
}

/// Logical worker identity. `authority` is unique within one coordinator;
/// multiple physical nodes may register under the same authority to form
/// an HA set, tracked via `node_ids`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Worker {
	pub id: Uuid,
	pub authority: ArcStr,
	pub frontend_mode: FrontendMode,
	pub protocol: Protocol,
	pub hostname: ArcStr,
	pub use_tls: bool,
	pub api_port: u16,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub port_range: Option<Vec<u16>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub wildcard_domain: Option<ArcStr>,
	#[serde(default)]
	pub filtered_apps_only: bool,
	pub accepted_traffics: Vec<TrafficClass>,
	#[serde(default)]
	pub app_filters: Vec<AppFilter>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	/// Stable per-process id of each physical node registered under this
	/// authority. A node re-registering (or an agent retrying a failed
	/// request) presents the same id and does not grow this set.
	#[serde(default = "single_node")]
	pub node_ids: BTreeSet<Uuid>,
}

fn single_node() -> BTreeSet<Uuid> {
	BTreeSet::from([Uuid::new_v4()])
}

impl Worker {
	/// Number of distinct physical processes registered under this authority.
	pub fn nodes(&self) -> u32 {
		self.node_ids.len() as u32
	}

	/// Total slot capacity, or `None` for the unbounded wildcard frontend.
	pub fn total_slots(&self) -> Option<usize> {
		match self.frontend_mode {
			FrontendMode::Port => Some(self.port_range.as_ref().map_or(0, |r| r.len())),
			FrontendMode::Wildcard => None,
		}
	}

	pub fn accepts(&self, class: TrafficClass) -> bool {
		self.accepted_traffics.contains(&class)
	}

	/// Returns true if this worker's advertised capabilities are
	/// consistent with an existing registration for the same authority.
	/// Used to reject conflicting re-registrations.
	pub fn compatible_with(&self, other: &Worker) -> bool {
		self.frontend_mode == other.frontend_mode
			&& self.protocol == other.protocol
			&& self.hostname == other.hostname
			&& self.use_tls == other.use_tls
	}
}

/// The worker-local ingress key a slot occupies: a port number for the
/// `port` frontend, or a subdomain label for `wildcard`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKey {
	Port(u16),
	Subdomain(ArcStr),
}

impl fmt::Display for SlotKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SlotKey::Port(p) => write!(f, "{p}"),
			SlotKey::Subdomain(s) => write!(f, "{s}"),
		}
	}
}

/// One backend replica within an inference circuit's routing table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteInfo {
	pub session_id: Uuid,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_name: Option<ArcStr>,
	pub kernel_host: ArcStr,
	pub kernel_port: u16,
	pub protocol: Protocol,
	#[serde(default = "default_traffic_ratio")]
	pub traffic_ratio: f64,
}

fn default_traffic_ratio() -> f64 {
	1.0
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppMode {
	Interactive,
	Inference,
}

impl From<AppMode> for TrafficClass {
	fn from(value: AppMode) -> Self {
		match value {
			AppMode::Interactive => TrafficClass::Interactive,
			AppMode::Inference => TrafficClass::Inference,
		}
	}
}

/// A live binding from a worker-exposed ingress key to one or more backend
/// kernel routes, with attached authentication and routing policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Circuit {
	pub id: Uuid,
	/// Empty for inference circuits.
	#[serde(default)]
	pub app: ArcStr,
	pub protocol: Protocol,
	pub worker: ArcStr,
	pub app_mode: AppMode,
	pub frontend_mode: FrontendMode,
	#[serde(default)]
	pub envs: HashMap<String, String>,
	#[serde(default)]
	pub arguments: Option<String>,
	pub open_to_public: bool,
	#[serde(default)]
	pub allowed_client_ips: Option<Vec<IpNet>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub port: Option<u16>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub subdomain: Option<ArcStr>,
	/// Interactive-only.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<Uuid>,
	/// Inference-only.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub endpoint_id: Option<Uuid>,
	#[serde(default)]
	pub route_info: Vec<RouteInfo>,
	/// Interactive-only: every session currently multiplexed on this
	/// circuit, all belonging to `user_id`.
	#[serde(default)]
	pub session_ids: Vec<Uuid>,
	/// Browser-cookie secret for non-public interactive circuits.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub auth_secret: Option<ArcStr>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Circuit {
	pub fn slot_key(&self) -> SlotKey {
		match self.frontend_mode {
			FrontendMode::Port => SlotKey::Port(self.port.expect("port circuit has a port")),
			FrontendMode::Wildcard => {
				SlotKey::Subdomain(self.subdomain.clone().expect("wildcard circuit has a subdomain"))
			},
		}
	}

	pub fn touch(&mut self) {
		self.updated_at = Utc::now();
	}
}

/// Manager-visible inference record; owns exactly one circuit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Endpoint {
	pub id: Uuid,
	pub service_name: ArcStr,
	#[serde(default)]
	pub tags: HashMap<String, String>,
	/// app name -> kernel host/port replicas.
	pub apps: HashMap<String, Vec<RouteInfo>>,
	pub open_to_public: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub preferred_port: Option<u16>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub preferred_subdomain: Option<ArcStr>,
	/// Idle-eviction TTL for this endpoint's circuit; `None` = infinite.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ttl_seconds: Option<u64>,
	pub circuit_id: Option<Uuid>,
}

/// One-shot token binding a login-session identifier + user identity +
/// preferred kernel endpoint, redeemed exactly once to create (or reuse)
/// an interactive circuit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfirmationToken {
	pub token: ArcStr,
	pub user_id: Uuid,
	pub group_id: Uuid,
	pub access_key: ArcStr,
	pub domain: ArcStr,
	pub kernel_host: ArcStr,
	pub kernel_port: u16,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub login_session_token: Option<ArcStr>,
	pub expires_at: DateTime<Utc>,
}

impl ConfirmationToken {
	pub fn is_expired(&self) -> bool {
		Utc::now() >= self.expires_at
	}
}

/// Long-lived bearer token authorizing calls through a non-public
/// inference circuit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiToken {
	pub token: ArcStr,
	pub endpoint_id: Uuid,
	pub user_id: Uuid,
	pub exp: DateTime<Utc>,
}

impl ApiToken {
	pub fn is_expired(&self) -> bool {
		Utc::now() >= self.exp
	}
}

/// Cross-node notifications published on the `coordinator/events` topic.
/// Coordinator replicas and worker agents both consume this stream to
/// converge on the authoritative state held in the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Event {
	#[serde(rename = "circuit-created")]
	CircuitCreated { circuit: Circuit },
	#[serde(rename = "circuit-updated")]
	CircuitUpdated { circuit: Circuit },
	#[serde(rename = "circuit-removed")]
	CircuitRemoved { circuit_id: Uuid, worker: ArcStr, key: SlotKey },
	#[serde(rename = "worker-registered")]
	WorkerRegistered { worker: Worker },
	#[serde(rename = "worker-removed")]
	WorkerRemoved { authority: ArcStr },
	/// A runtime anomaly that never poisons a subsequent request but
	/// must be observable cluster-wide.
	#[serde(rename = "anomaly")]
	Anomaly { message: String, circuit_id: Option<Uuid> },
}
