//! The routing table: staged changesets applied atomically, matched per request.
//!
//! Shape follows the store/binds.rs pattern: a single `RwLock` guards the active table,
//! mutations accumulate in a staging area and are swapped in wholesale on commit, and a
//! broadcast channel notifies observers (the health/metrics server, mainly) of changes.

use std::sync::Arc;

use gateway_core::prelude::Strng;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::types::{Route, RouteId, SessionId};

#[derive(Clone, Debug)]
pub enum Event {
	Added(RouteId),
	Removed(RouteId),
}

#[derive(Default)]
struct Table {
	routes: Vec<Arc<Route>>,
	next_insertion_order: u64,
}

impl Table {
	fn sorted_candidates(&self, host: &str, path: &str) -> Vec<Arc<Route>> {
		let mut matches: Vec<Arc<Route>> = self
			.routes
			.iter()
			.filter(|r| r.matches_domain(host) && path_prefix_matches(&r.path_prefix, path))
			.cloned()
			.collect();
		matches.sort_by(|a, b| {
			b.priority
				.cmp(&a.priority)
				.then_with(|| b.path_prefix.len().cmp(&a.path_prefix.len()))
				.then_with(|| a.insertion_order.cmp(&b.insertion_order))
		});
		matches
	}
}

/// A path prefix matches on segment boundaries: `/api` matches `/api` and `/api/v2`, but
/// not `/apiextra`.
fn path_prefix_matches(prefix: &str, path: &str) -> bool {
	if prefix == "/" {
		return true;
	}
	let prefix = prefix.trim_end_matches('/');
	path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

/// Whether an unmatched request should be dropped silently (true) or answered with a 404.
#[derive(Clone, Copy, Debug, Default)]
pub struct Blackhole(pub bool);

pub struct RoutingTable {
	table: RwLock<Table>,
	tx: broadcast::Sender<Event>,
	pub blackhole: Blackhole,
}

impl RoutingTable {
	pub fn new(blackhole: Blackhole) -> Arc<RoutingTable> {
		let (tx, _) = broadcast::channel(256);
		Arc::new(RoutingTable {
			table: RwLock::new(Table::default()),
			tx,
			blackhole,
		})
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Event> {
		self.tx.subscribe()
	}

	/// Finds the highest-priority route matching `host`/`path`, per the spec's sort order:
	/// `(priority desc, len(path_prefix) desc, insertion_order asc)`.
	pub fn find(&self, host: &str, path: &str) -> Option<Arc<Route>> {
		let table = self.table.read();
		table.sorted_candidates(host, path).into_iter().next()
	}

	pub fn active_count(&self) -> usize {
		self.table.read().routes.len()
	}

	/// Whether a request with no matching route should be dropped (true) instead of answered
	/// with a 404.
	pub fn is_blackhole(&self) -> bool {
		self.blackhole.0
	}

	pub fn all(&self) -> Vec<Arc<Route>> {
		self.table.read().routes.clone()
	}

	/// Begins a staged change-set. Nothing is visible to `find` until `commit` is called.
	pub fn stage(self: &Arc<Self>) -> StagedChange {
		StagedChange {
			table: self.clone(),
			add: Vec::new(),
			remove: Vec::new(),
		}
	}

	/// Atomically removes every route owned by `session`, used on session expiry.
	pub fn purge_session(&self, session: &SessionId) -> Vec<RouteId> {
		let mut table = self.table.write();
		let (keep, removed): (Vec<_>, Vec<_>) = table
			.routes
			.drain(..)
			.partition(|r| r.owner_session.as_ref() != Some(session));
		table.routes = keep;
		let ids: Vec<RouteId> = removed.iter().map(|r| r.route_id.clone()).collect();
		drop(table);
		for id in &ids {
			let _ = self.tx.send(Event::Removed(id.clone()));
		}
		ids
	}
}

pub struct StagedChange {
	table: Arc<RoutingTable>,
	add: Vec<Route>,
	remove: Vec<RouteId>,
}

impl StagedChange {
	pub fn add(&mut self, route: Route) -> &mut Self {
		self.add.push(route);
		self
	}

	pub fn remove(&mut self, id: RouteId) -> &mut Self {
		self.remove.push(id);
		self
	}

	/// Validates the staged set against the uniqueness invariant: no two routes may share
	/// `(domain, path_prefix, priority)`. Checked against both the rest of this batch and
	/// every route already active in the table (routes this same batch removes don't count).
	pub fn validate(&self) -> Result<(), ValidationError> {
		let mut seen: std::collections::HashSet<(Strng, Strng, i32)> = std::collections::HashSet::new();

		{
			let table = self.table.table.read();
			for existing in table.routes.iter() {
				if self.remove.contains(&existing.route_id) {
					continue;
				}
				for d in &existing.domains {
					seen.insert((d.clone(), existing.path_prefix.clone(), existing.priority));
				}
			}
		}

		for r in &self.add {
			for d in &r.domains {
				let key = (d.clone(), r.path_prefix.clone(), r.priority);
				if !seen.insert(key.clone()) {
					return Err(ValidationError::DuplicateRoute { domain: key.0, prefix: key.1, priority: key.2 });
				}
			}
		}
		Ok(())
	}

	/// Applies the staged add/remove set in one atomic write-lock section.
	pub fn commit(self) -> Vec<Event> {
		let mut table = self.table.table.write();
		let mut events = Vec::with_capacity(self.add.len() + self.remove.len());

		if !self.remove.is_empty() {
			table.routes.retain(|r| {
				let drop = self.remove.contains(&r.route_id);
				if drop {
					events.push(Event::Removed(r.route_id.clone()));
				}
				!drop
			});
		}

		for mut route in self.add {
			route.insertion_order = table.next_insertion_order;
			table.next_insertion_order += 1;
			let id = route.route_id.clone();
			table.routes.push(Arc::new(route));
			events.push(Event::Added(id));
		}
		drop(table);

		for ev in &events {
			let _ = self.table.tx.send(ev.clone());
		}
		events
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
	#[error("duplicate route for domain {domain} path_prefix {prefix} priority {priority}")]
	DuplicateRoute { domain: Strng, prefix: Strng, priority: i32 },
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::types::{BackendState, CircuitBreakerThresholds, HeaderPolicy, RouteOptions};

	fn route(id: &str, domain: &str, prefix: &str, priority: i32) -> Route {
		Route {
			route_id: id.into(),
			domains: vec![domain.into()],
			path_prefix: prefix.into(),
			backend_url: "http://127.0.0.1:9000".into(),
			priority,
			request_headers: HeaderPolicy::default(),
			response_headers: HeaderPolicy::default(),
			options: RouteOptions::default(),
			owner_session: None,
			insertion_order: 0,
			backend_state: Arc::new(BackendState::new(CircuitBreakerThresholds::default())),
		}
	}

	#[test]
	fn find_prefers_longer_prefix() {
		let table = RoutingTable::new(Blackhole(false));
		let mut change = table.stage();
		change.add(route("root", "example.com", "/", 0));
		change.add(route("api", "example.com", "/api", 0));
		change.commit();

		let found = table.find("example.com", "/api/v2").unwrap();
		assert_eq!(found.route_id.as_str(), "api");
	}

	#[test]
	fn find_respects_priority_over_prefix_length() {
		let table = RoutingTable::new(Blackhole(false));
		let mut change = table.stage();
		change.add(route("low", "example.com", "/api", 0));
		change.add(route("high", "example.com", "/", 10));
		change.commit();

		let found = table.find("example.com", "/api/v2").unwrap();
		assert_eq!(found.route_id.as_str(), "high");
	}

	#[test]
	fn path_prefix_is_segment_bound() {
		let table = RoutingTable::new(Blackhole(false));
		let mut change = table.stage();
		change.add(route("api", "example.com", "/api", 0));
		change.commit();
		assert!(table.find("example.com", "/apiextra").is_none());
		assert!(table.find("example.com", "/api").is_some());
	}

	#[test]
	fn purge_session_removes_only_owned_routes() {
		let table = RoutingTable::new(Blackhole(false));
		let mut r1 = route("a", "example.com", "/", 0);
		r1.owner_session = Some("sess-1".into());
		let r2 = route("b", "other.com", "/", 0);
		let mut change = table.stage();
		change.add(r1);
		change.add(r2);
		change.commit();

		let removed = table.purge_session(&Strng::from("sess-1"));
		assert_eq!(removed.len(), 1);
		assert!(table.find("example.com", "/").is_none());
		assert!(table.find("other.com", "/").is_some());
	}

	#[test]
	fn validate_rejects_duplicate_against_active_table() {
		let table = RoutingTable::new(Blackhole(false));
		let mut change = table.stage();
		change.add(route("a", "example.com", "/", 0));
		change.commit();

		let mut change2 = table.stage();
		change2.add(route("b", "example.com", "/", 0));
		assert!(change2.validate().is_err());
	}

	#[test]
	fn validate_ignores_keys_being_removed_in_the_same_batch() {
		let table = RoutingTable::new(Blackhole(false));
		let mut change = table.stage();
		change.add(route("a", "example.com", "/", 0));
		change.commit();

		let mut change2 = table.stage();
		change2.remove("a".into());
		change2.add(route("b", "example.com", "/", 0));
		assert!(change2.validate().is_ok());
	}

	#[test]
	#[allow(unused_must_use)]
	fn staged_changes_invisible_until_commit() {
		let table = RoutingTable::new(Blackhole(false));
		let mut change = table.stage();
		change.add(route("a", "example.com", "/", 0));
		assert!(table.find("example.com", "/").is_none());
		change.commit();
		assert!(table.find("example.com", "/").is_some());
		let _ = Duration::ZERO;
	}
}
