//! Core data model: routes, backend resilience state, sessions, certificate entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use gateway_core::prelude::Strng;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Stable identifier assigned to a route when it is activated.
pub type RouteId = Strng;

/// Stable identifier assigned to a control-plane session on REGISTER.
pub type SessionId = Strng;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderOp {
	pub name: Strng,
	pub value: Strng,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderPolicy {
	pub add: Vec<HeaderOp>,
	pub remove: Vec<Strng>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerThresholds {
	pub failure_threshold: u32,
	pub success_threshold: u32,
	pub open_timeout: Duration,
}

impl Default for CircuitBreakerThresholds {
	fn default() -> Self {
		Self {
			failure_threshold: 5,
			success_threshold: 2,
			open_timeout: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteOptions {
	pub request_timeout: Option<Duration>,
	pub max_request_body: Option<usize>,
	pub max_response_body: Option<usize>,
	pub retries: u32,
	pub compression: bool,
	/// Content-type prefixes eligible for compression, e.g. `"text/"`, `"application/json"`.
	pub compress_content_types: Vec<String>,
	/// Responses smaller than this (by `Content-Length`, when known) are sent uncompressed.
	pub compress_min_size: usize,
	pub websocket: bool,
	pub circuit_breaker: CircuitBreakerThresholds,
	pub rate_limit_rps: Option<u32>,
}

impl Default for RouteOptions {
	fn default() -> Self {
		Self {
			request_timeout: None,
			max_request_body: None,
			max_response_body: None,
			retries: 0,
			compression: false,
			compress_content_types: vec![
				"text/".to_string(),
				"application/json".to_string(),
				"application/javascript".to_string(),
				"application/xml".to_string(),
			],
			compress_min_size: 1024,
			websocket: false,
			circuit_breaker: CircuitBreakerThresholds::default(),
			rate_limit_rps: None,
		}
	}
}

/// A route published either by a control-plane session or loaded from the static site config.
#[derive(Debug, Clone)]
pub struct Route {
	pub route_id: RouteId,
	pub domains: Vec<Strng>,
	pub path_prefix: Strng,
	pub backend_url: Strng,
	pub priority: i32,
	pub request_headers: HeaderPolicy,
	pub response_headers: HeaderPolicy,
	pub options: RouteOptions,
	pub owner_session: Option<SessionId>,
	pub insertion_order: u64,
	pub backend_state: Arc<BackendState>,
}

impl Route {
	/// A route matches a hostname if it has an exact entry, or a `*.suffix` pattern whose
	/// suffix is a strict parent of `host`.
	pub fn matches_domain(&self, host: &str) -> bool {
		self.domains.iter().any(|d| domain_matches(d, host))
	}
}

/// Lowercases and strips a single trailing dot, per the spec's hostname normalization rule.
/// Applied to both SNI server names and routing `Host` headers before any comparison.
pub fn normalize_host(host: &str) -> String {
	host.strip_suffix('.').unwrap_or(host).to_ascii_lowercase()
}

pub fn domain_matches(pattern: &str, host: &str) -> bool {
	let host = normalize_host(host);
	let pattern = normalize_host(pattern);
	if let Some(suffix) = pattern.strip_prefix("*.") {
		host.len() > suffix.len() + 1 && host.ends_with(suffix) && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
	} else {
		pattern == host
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CircuitState {
	Closed = 0,
	Open = 1,
	HalfOpen = 2,
}

impl From<u8> for CircuitState {
	fn from(v: u8) -> Self {
		match v {
			1 => CircuitState::Open,
			2 => CircuitState::HalfOpen,
			_ => CircuitState::Closed,
		}
	}
}

/// Per-route runtime resilience state: circuit breaker, maintenance mode, progressive drain.
///
/// Field layout mirrors the kairos-rs circuit breaker (atomics for the hot path, a lock only
/// around the rarely-written timestamp).
pub struct BackendState {
	thresholds: RwLock<CircuitBreakerThresholds>,
	state: AtomicU8,
	failure_count: AtomicU64,
	success_count: AtomicU64,
	opened_at: RwLock<Option<Instant>>,

	half_open_probe: AtomicU8,

	maintenance: AtomicU8,
	maintenance_redirect: RwLock<Option<Strng>>,
	maintenance_hits: AtomicU64,

	draining: AtomicU8,
	drain_start: RwLock<Option<Instant>>,
	drain_duration: RwLock<Duration>,
	drain_rejected: AtomicU64,
}

impl BackendState {
	pub fn new(thresholds: CircuitBreakerThresholds) -> Self {
		Self {
			thresholds: RwLock::new(thresholds),
			state: AtomicU8::new(CircuitState::Closed as u8),
			failure_count: AtomicU64::new(0),
			success_count: AtomicU64::new(0),
			opened_at: RwLock::new(None),
			half_open_probe: AtomicU8::new(0),
			maintenance: AtomicU8::new(0),
			maintenance_redirect: RwLock::new(None),
			maintenance_hits: AtomicU64::new(0),
			draining: AtomicU8::new(0),
			drain_start: RwLock::new(None),
			drain_duration: RwLock::new(Duration::ZERO),
			drain_rejected: AtomicU64::new(0),
		}
	}

	pub fn circuit_state(&self) -> CircuitState {
		CircuitState::from(self.state.load(Ordering::Acquire))
	}

	pub fn thresholds(&self) -> CircuitBreakerThresholds {
		*self.thresholds.read()
	}

	/// Updates the breaker's thresholds in place, e.g. via `CIRCUIT_BREAKER_SET`. Does not
	/// reset current counters or state.
	pub fn set_thresholds(&self, thresholds: CircuitBreakerThresholds) {
		*self.thresholds.write() = thresholds;
	}

	/// Forces the breaker back to `Closed` with counters reset, e.g. via
	/// `CIRCUIT_BREAKER_RESET`.
	pub fn reset_circuit(&self) {
		self.transition_to_closed();
	}

	/// Called before dispatching a request upstream. Transitions Open -> HalfOpen once the
	/// open_timeout has elapsed, mirroring `is_open()` in the kairos-rs breaker.
	///
	/// In `HalfOpen`, at most one concurrent caller is admitted: the rest see `false` until
	/// that probe resolves via `on_success`/`on_failure`.
	pub fn allow_request(&self) -> bool {
		match self.circuit_state() {
			CircuitState::Closed => true,
			CircuitState::HalfOpen => self.try_admit_half_open_probe(),
			CircuitState::Open => {
				let elapsed = self.opened_at.read().map(|t| t.elapsed());
				if elapsed.is_some_and(|e| e >= self.thresholds().open_timeout) {
					self.transition_to_half_open();
					self.try_admit_half_open_probe()
				} else {
					false
				}
			},
		}
	}

	fn try_admit_half_open_probe(&self) -> bool {
		self.half_open_probe.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_ok()
	}

	fn release_half_open_probe(&self) {
		self.half_open_probe.store(0, Ordering::Release);
	}

	pub fn on_success(&self) {
		match self.circuit_state() {
			CircuitState::HalfOpen => {
				let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
				if successes >= self.thresholds().success_threshold as u64 {
					self.transition_to_closed();
				}
				self.release_half_open_probe();
			},
			CircuitState::Closed => {
				self.failure_count.store(0, Ordering::Release);
			},
			CircuitState::Open => {},
		}
	}

	pub fn on_failure(&self) {
		match self.circuit_state() {
			CircuitState::Closed => {
				let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
				if failures >= self.thresholds().failure_threshold as u64 {
					self.transition_to_open();
				}
			},
			CircuitState::HalfOpen => self.transition_to_open(),
			CircuitState::Open => {},
		}
	}

	fn transition_to_open(&self) {
		self.state.store(CircuitState::Open as u8, Ordering::Release);
		*self.opened_at.write() = Some(Instant::now());
		self.success_count.store(0, Ordering::Release);
		self.release_half_open_probe();
	}

	fn transition_to_half_open(&self) {
		// compare_exchange so concurrent callers racing the Open->HalfOpen transition don't
		// each reset success_count out from under the other's admitted probe.
		if self.state.compare_exchange(CircuitState::Open as u8, CircuitState::HalfOpen as u8, Ordering::AcqRel, Ordering::Acquire).is_ok() {
			self.success_count.store(0, Ordering::Release);
		}
	}

	fn transition_to_closed(&self) {
		self.state.store(CircuitState::Closed as u8, Ordering::Release);
		self.failure_count.store(0, Ordering::Release);
		self.success_count.store(0, Ordering::Release);
		self.release_half_open_probe();
	}

	pub fn enter_maintenance(&self, redirect: Option<Strng>) {
		self.maintenance.store(1, Ordering::Release);
		*self.maintenance_redirect.write() = redirect;
		self.maintenance_hits.store(0, Ordering::Release);
	}

	pub fn exit_maintenance(&self) {
		self.maintenance.store(0, Ordering::Release);
		*self.maintenance_redirect.write() = None;
	}

	pub fn in_maintenance(&self) -> bool {
		self.maintenance.load(Ordering::Acquire) == 1
	}

	pub fn maintenance_redirect(&self) -> Option<Strng> {
		self.maintenance_redirect.read().clone()
	}

	pub fn record_maintenance_hit(&self) {
		self.maintenance_hits.fetch_add(1, Ordering::Relaxed);
	}

	pub fn start_drain(&self, duration: Duration) {
		self.draining.store(1, Ordering::Release);
		*self.drain_start.write() = Some(Instant::now());
		*self.drain_duration.write() = duration;
	}

	pub fn cancel_drain(&self) {
		self.draining.store(0, Ordering::Release);
		*self.drain_start.write() = None;
	}

	pub fn is_draining(&self) -> bool {
		self.draining.load(Ordering::Acquire) == 1
	}

	/// Progress of the drain in `[0, 1]`; the Request Pipeline uses this as the probability
	/// of rejecting a given request.
	pub fn drain_progress(&self) -> f64 {
		let Some(start) = *self.drain_start.read() else {
			return 0.0;
		};
		let duration = *self.drain_duration.read();
		if duration.is_zero() {
			return 1.0;
		}
		(start.elapsed().as_secs_f64() / duration.as_secs_f64()).min(1.0)
	}

	pub fn record_drain_rejection(&self) {
		self.drain_rejected.fetch_add(1, Ordering::Relaxed);
	}

	pub fn stats(&self) -> BackendStats {
		BackendStats {
			circuit_state: self.circuit_state(),
			failure_count: self.failure_count.load(Ordering::Relaxed),
			success_count: self.success_count.load(Ordering::Relaxed),
			in_maintenance: self.in_maintenance(),
			maintenance_hits: self.maintenance_hits.load(Ordering::Relaxed),
			is_draining: self.is_draining(),
			drain_progress: self.drain_progress(),
			drain_rejected: self.drain_rejected.load(Ordering::Relaxed),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BackendStats {
	pub circuit_state: CircuitState,
	pub failure_count: u64,
	pub success_count: u64,
	pub in_maintenance: bool,
	pub maintenance_hits: u64,
	pub is_draining: bool,
	pub drain_progress: f64,
	pub drain_rejected: u64,
}

/// What gates a request from reaching the upstream, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
	CircuitOpen,
	Maintenance,
	DrainRejected,
}

impl BackendState {
	/// Evaluates the precedence order from the spec: circuit-open, then maintenance, then
	/// probabilistic drain rejection. Returns `None` when the request should proceed.
	pub fn check(&self, roll: f64) -> Option<Suppression> {
		if !self.allow_request() {
			return Some(Suppression::CircuitOpen);
		}
		if self.in_maintenance() {
			return Some(Suppression::Maintenance);
		}
		if self.is_draining() && roll < self.drain_progress() {
			return Some(Suppression::DrainRejected);
		}
		None
	}
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
	pub session_id: SessionId,
	pub service_name: Strng,
	pub instance_name: Strng,
	pub metadata: HashMap<String, String>,
	pub connected_at: Instant,
	pub last_activity: RwLock<Instant>,
	pub active_route_ids: RwLock<Vec<RouteId>>,
}

impl SessionRecord {
	pub fn touch(&self) {
		*self.last_activity.write() = Instant::now();
	}
}

/// A loaded TLS certificate entry: the domains it covers and when it was loaded.
#[derive(Clone)]
pub struct CertificateEntry {
	pub domains: Vec<Strng>,
	pub key: Arc<rustls::sign::CertifiedKey>,
	pub source_files: Vec<std::path::PathBuf>,
	pub loaded_at: Instant,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wildcard_domain_match() {
		assert!(domain_matches("*.example.com", "api.example.com"));
		assert!(!domain_matches("*.example.com", "example.com"));
		assert!(!domain_matches("*.example.com", "evilexample.com"));
		assert!(domain_matches("example.com", "example.com"));
	}

	#[test]
	fn circuit_breaker_opens_after_threshold() {
		let state = BackendState::new(CircuitBreakerThresholds {
			failure_threshold: 3,
			success_threshold: 1,
			open_timeout: Duration::from_millis(10),
		});
		for _ in 0..2 {
			state.on_failure();
			assert_eq!(state.circuit_state(), CircuitState::Closed);
		}
		state.on_failure();
		assert_eq!(state.circuit_state(), CircuitState::Open);
		assert!(!state.allow_request());
	}

	#[test]
	fn circuit_breaker_half_opens_then_closes() {
		let state = BackendState::new(CircuitBreakerThresholds {
			failure_threshold: 1,
			success_threshold: 1,
			open_timeout: Duration::from_millis(5),
		});
		state.on_failure();
		assert_eq!(state.circuit_state(), CircuitState::Open);
		std::thread::sleep(Duration::from_millis(10));
		assert!(state.allow_request());
		assert_eq!(state.circuit_state(), CircuitState::HalfOpen);
		state.on_success();
		assert_eq!(state.circuit_state(), CircuitState::Closed);
	}

	#[test]
	fn half_open_admits_exactly_one_probe() {
		let state = BackendState::new(CircuitBreakerThresholds {
			failure_threshold: 1,
			success_threshold: 5,
			open_timeout: Duration::from_millis(5),
		});
		state.on_failure();
		std::thread::sleep(Duration::from_millis(10));
		assert!(state.allow_request(), "first probe should be admitted");
		assert!(!state.allow_request(), "second concurrent probe should be turned away");
		assert!(!state.allow_request(), "still no slot while the first probe is outstanding");
		state.on_success();
		assert!(state.allow_request(), "slot frees up once the outstanding probe resolves");
	}

	#[test]
	fn maintenance_hits_reset_on_reentry() {
		let state = BackendState::new(CircuitBreakerThresholds::default());
		state.enter_maintenance(None);
		state.record_maintenance_hit();
		state.record_maintenance_hit();
		state.exit_maintenance();
		state.enter_maintenance(None);
		assert_eq!(state.stats().maintenance_hits, 0);
	}

	#[test]
	fn precedence_circuit_before_maintenance_before_drain() {
		let state = BackendState::new(CircuitBreakerThresholds {
			failure_threshold: 1,
			success_threshold: 1,
			open_timeout: Duration::from_secs(30),
		});
		state.enter_maintenance(None);
		state.start_drain(Duration::from_secs(10));
		state.on_failure();
		assert_eq!(state.check(0.0), Some(Suppression::CircuitOpen));
	}

	#[test]
	fn drain_progress_reaches_one_after_duration() {
		let state = BackendState::new(CircuitBreakerThresholds::default());
		state.start_drain(Duration::from_millis(5));
		std::thread::sleep(Duration::from_millis(10));
		assert_eq!(state.drain_progress(), 1.0);
		assert_eq!(state.check(0.99), Some(Suppression::DrainRejected));
	}
}
