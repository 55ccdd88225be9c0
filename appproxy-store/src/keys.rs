//! Key-path layout for the persisted-state tree. Centralized
//! here so the coordinator, worker, and test fixtures never hand-build a
//! path and drift out of sync with each other.

pub const EVENTS_TOPIC: &str = "coordinator/events";

pub fn worker(authority: &str) -> String {
	format!("coordinator/workers/{authority}")
}

pub fn workers_prefix() -> String {
	"coordinator/workers/".to_string()
}

pub fn slot(authority: &str, key: &str) -> String {
	format!("coordinator/workers/{authority}/slots/{key}")
}

pub fn slots_prefix(authority: &str) -> String {
	format!("coordinator/workers/{authority}/slots/")
}

pub fn circuit(id: &str) -> String {
	format!("coordinator/circuits/{id}")
}

pub fn circuits_prefix() -> String {
	"coordinator/circuits/".to_string()
}

pub fn circuit_by_worker(authority: &str, id: &str) -> String {
	format!("coordinator/circuits-by-worker/{authority}/{id}")
}

pub fn circuits_by_worker_prefix(authority: &str) -> String {
	format!("coordinator/circuits-by-worker/{authority}/")
}

pub fn endpoint(id: &str) -> String {
	format!("coordinator/endpoints/{id}")
}

pub fn endpoints_prefix() -> String {
	"coordinator/endpoints/".to_string()
}

pub fn confirmation_token(token: &str) -> String {
	format!("coordinator/tokens/conf/{token}")
}

pub fn api_token(token: &str) -> String {
	format!("coordinator/tokens/api/{token}")
}

/// Advisory lock key guarding interactive-circuit reuse coalescing:
/// whoever wins `create_if_absent` on this key owns the right to either
/// create a new circuit for this fingerprint or attach to one that is
/// concurrently being created.
pub fn fingerprint_lock(digest: &str) -> String {
	format!("coordinator/locks/fp/{digest}")
}

/// Reverse index from a circuit back to the fingerprint digest that
/// created it, so removal can release the matching reuse pointer without
/// the caller having to recompute or carry the original request fields.
pub fn fingerprint_by_circuit(circuit_id: &str) -> String {
	format!("coordinator/locks/fp-by-circuit/{circuit_id}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn slot_key_is_nested_under_its_worker() {
		let s = slot("worker-a", "8080");
		assert!(s.starts_with(&worker("worker-a")));
	}

	#[test]
	fn prefixes_are_proper_prefixes_of_their_keys() {
		assert!(worker("w").starts_with(&workers_prefix()));
		assert!(circuit("c1").starts_with(&circuits_prefix()));
		assert!(endpoint("e1").starts_with(&endpoints_prefix()));
		assert!(circuit_by_worker("w", "c1").starts_with(&circuits_by_worker_prefix("w")));
	}
}
