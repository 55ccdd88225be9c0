//! Inference Router: weighted random sampling over an
//! inference circuit's live routes.

use appproxy_core::model::RouteInfo;
use rand::Rng;

/// Picks one route proportional to `traffic_ratio`. Routes with a zero
/// ratio are excluded; if every route is zero, falls back to a uniform
/// pick among all of them. Returns `None` only when `routes` is empty —
/// the caller turns that into a 503.
pub fn select_route<'a>(routes: &'a [RouteInfo], rng: &mut impl Rng) -> Option<&'a RouteInfo> {
	if routes.is_empty() {
		return None;
	}

	let total: f64 = routes.iter().map(|r| r.traffic_ratio.max(0.0)).sum();
	if total <= 0.0 {
		let idx = rng.random_range(0..routes.len());
		return Some(&routes[idx]);
	}

	let mut pick = rng.random_range(0.0..total);
	for route in routes {
		let weight = route.traffic_ratio.max(0.0);
		if weight <= 0.0 {
			continue;
		}
		if pick < weight {
			return Some(route);
		}
		pick -= weight;
	}
	// Floating-point rounding can leave `pick` a hair past the last
	// positive-weight route; fall back to it rather than returning None.
	routes.iter().rev().find(|r| r.traffic_ratio > 0.0)
}

#[cfg(test)]
mod tests {
	use appproxy_core::model::Protocol;
	use rand::SeedableRng;
	use rand::rngs::StdRng;
	use uuid::Uuid;

	use super::*;

	fn route(ratio: f64) -> RouteInfo {
		RouteInfo {
			session_id: Uuid::new_v4(),
			session_name: None,
			kernel_host: "k".into(),
			kernel_port: 8080,
			protocol: Protocol::Http,
			traffic_ratio: ratio,
		}
	}

	#[test]
	fn empty_routes_yield_none() {
		let mut rng = StdRng::seed_from_u64(1);
		assert!(select_route(&[], &mut rng).is_none());
	}

	#[test]
	fn zero_ratio_routes_are_never_picked() {
		let routes = vec![route(0.0), route(1.0)];
		let mut rng = StdRng::seed_from_u64(7);
		for _ in 0..200 {
			let picked = select_route(&routes, &mut rng).unwrap();
			assert_eq!(picked.traffic_ratio, 1.0);
		}
	}

	#[test]
	fn all_zero_falls_back_to_uniform() {
		let routes = vec![route(0.0), route(0.0)];
		let mut rng = StdRng::seed_from_u64(3);
		let picked = select_route(&routes, &mut rng);
		assert!(picked.is_some());
	}

	#[test]
	fn converges_to_configured_ratio() {
		let routes = vec![route(3.0), route(1.0)];
		let mut rng = StdRng::seed_from_u64(42);
		let mut first = 0u32;
		const N: u32 = 20_000;
		for _ in 0..N {
			let picked = select_route(&routes, &mut rng).unwrap();
			if picked.session_id == routes[0].session_id {
				first += 1;
			}
		}
		let fraction = f64::from(first) / f64::from(N);
		assert!((fraction - 0.75).abs() < 0.02, "fraction was {fraction}");
	}
}
