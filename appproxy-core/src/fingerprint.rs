use std::collections::BTreeMap;

use ipnet::IpNet;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::model::Protocol;

/// Canonical summary of an interactive circuit-creation request, used by
/// the Circuit Registry to decide reuse and to key the advisory
/// fingerprint lock that coalesces concurrent creators.
#[derive(Clone, Debug)]
pub struct Fingerprint {
	pub user_id: Uuid,
	pub app: String,
	pub kernel_host: String,
	pub kernel_port: u16,
	pub protocol: Protocol,
	pub envs: BTreeMap<String, String>,
	pub arguments: Option<String>,
	pub open_to_public: bool,
	pub allowed_client_ips: Option<Vec<IpNet>>,
	pub preferred_port: Option<u16>,
	pub preferred_subdomain: Option<String>,
}

impl Fingerprint {
	/// A stable, order-independent digest suitable as a store key
	/// (`coordinator/locks/fp/{fingerprint}`) and as the Circuit Registry's
	/// reuse index key.
	pub fn digest(&self) -> String {
		let mut hasher = Sha256::new();
		hasher.update(self.user_id.as_bytes());
		hasher.update(self.app.as_bytes());
		hasher.update(self.kernel_host.as_bytes());
		hasher.update(self.kernel_port.to_be_bytes());
		hasher.update([self.protocol.as_proto_tag()]);
		for (k, v) in &self.envs {
			hasher.update(k.as_bytes());
			hasher.update(b"=");
			hasher.update(v.as_bytes());
			hasher.update(b";");
		}
		if let Some(args) = &self.arguments {
			hasher.update(args.as_bytes());
		}
		hasher.update([self.open_to_public as u8]);
		if let Some(cidrs) = &self.allowed_client_ips {
			let mut rendered: Vec<String> = cidrs.iter().map(|c| c.to_string()).collect();
			rendered.sort();
			for c in rendered {
				hasher.update(c.as_bytes());
			}
		}
		if let Some(p) = self.preferred_port {
			hasher.update(p.to_be_bytes());
		}
		if let Some(s) = &self.preferred_subdomain {
			hasher.update(s.as_bytes());
		}
		hex::encode(hasher.finalize())
	}
}

trait ProtoTag {
	fn as_proto_tag(self) -> u8;
}

impl ProtoTag for Protocol {
	fn as_proto_tag(self) -> u8 {
		match self {
			Protocol::Http => 0,
			Protocol::Grpc => 1,
			Protocol::H2 => 2,
			Protocol::Tcp => 3,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base() -> Fingerprint {
		Fingerprint {
			user_id: Uuid::nil(),
			app: "jupyter".into(),
			kernel_host: "10.0.0.7".into(),
			kernel_port: 30080,
			protocol: Protocol::Http,
			envs: BTreeMap::new(),
			arguments: None,
			open_to_public: false,
			allowed_client_ips: None,
			preferred_port: None,
			preferred_subdomain: None,
		}
	}

	#[test]
	fn identical_requests_fingerprint_equal() {
		assert_eq!(base().digest(), base().digest());
	}

	#[test]
	fn no_reuse_flag_is_not_part_of_fingerprint() {
		// no_reuse is a caller directive handled by the registry, not part
		// of the identity of the request; this is just documentation that
		// Fingerprint intentionally has no such field.
		let a = base();
		let b = base();
		assert_eq!(a.digest(), b.digest());
	}

	#[test]
	fn differing_app_changes_digest() {
		let mut other = base();
		other.app = "tensorboard".into();
		assert_ne!(base().digest(), other.digest());
	}

	#[test]
	fn env_order_does_not_affect_digest() {
		let mut a = base();
		a.envs.insert("B".into(), "2".into());
		a.envs.insert("A".into(), "1".into());
		let mut b = base();
		b.envs.insert("A".into(), "1".into());
		b.envs.insert("B".into(), "2".into());
		assert_eq!(a.digest(), b.digest());
	}
}
