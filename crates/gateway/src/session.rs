//! Control-plane session manager: a line-oriented, `|`-delimited protocol over a
//! persistent TCP connection, staging route changes and applying them atomically into
//! the Routing Table and Backend State.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gateway_core::drain::DrainWatcher;
use gateway_core::prelude::Strng;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::routing::RoutingTable;
use crate::types::{
	BackendState, CircuitBreakerThresholds, HeaderOp, HeaderPolicy, Route, RouteId, RouteOptions,
	SessionId, SessionRecord,
};

fn parse_header_list(s: &str) -> Vec<HeaderOp> {
	s.split(',')
		.filter(|kv| !kv.is_empty())
		.filter_map(|kv| kv.split_once('='))
		.map(|(name, value)| HeaderOp { name: Strng::from(name), value: Strng::from(value) })
		.collect()
}

const MAX_COMMAND_LINE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct SessionManagerConfig {
	pub grace_window: Duration,
	pub staging_idle_timeout: Duration,
}

impl Default for SessionManagerConfig {
	fn default() -> Self {
		Self {
			grace_window: Duration::from_secs(60),
			staging_idle_timeout: Duration::from_secs(30 * 60),
		}
	}
}

#[derive(Debug, Clone)]
enum StagedOp {
	Add { route_id: RouteId, domains: Vec<Strng>, path_prefix: Strng, backend_url: Strng, priority: i32 },
	Remove { route_id: RouteId },
	HeadersSet { target: Target, add: Vec<HeaderOp>, to_response: bool },
	HeadersRemove { target: Target, names: Vec<Strng>, to_response: bool },
	OptionsSet { target: Target, options: RouteOptions },
	OptionsRemove { target: Target },
	HealthSet { target: Target, healthy: bool },
	RateLimitSet { target: Target, rps: Option<u32> },
	CircuitBreakerSet { target: Target, thresholds: CircuitBreakerThresholds },
}

#[derive(Debug, Clone)]
enum Target {
	All,
	One(RouteId),
}

struct Staging {
	ops: Vec<StagedOp>,
	last_touched: Instant,
	route_id_counter: u64,
}

impl Staging {
	fn new() -> Self {
		Self { ops: Vec::new(), last_touched: Instant::now(), route_id_counter: 0 }
	}

	fn touch(&mut self) {
		self.last_touched = Instant::now();
	}
}

struct SessionEntry {
	record: Arc<SessionRecord>,
	staging: RwLock<Staging>,
	events: broadcast::Sender<String>,
	connected: std::sync::atomic::AtomicBool,
}

/// Owns every active and grace-window session, and applies staged changes into the
/// routing table / backend state on `CONFIG_APPLY`.
pub struct SessionManager {
	sessions: RwLock<HashMap<SessionId, Arc<SessionEntry>>>,
	routing: Arc<RoutingTable>,
	cfg: SessionManagerConfig,
	next_session_seq: std::sync::atomic::AtomicU64,
}

impl SessionManager {
	pub fn new(routing: Arc<RoutingTable>, cfg: SessionManagerConfig) -> Arc<SessionManager> {
		Arc::new(SessionManager {
			sessions: RwLock::new(HashMap::new()),
			routing,
			cfg,
			next_session_seq: Default::default(),
		})
	}

	fn register(&self, service_name: Strng, instance_name: Strng, metadata: HashMap<String, String>) -> SessionId {
		let seq = self.next_session_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		let session_id: SessionId = format!("sess-{seq:016x}").into();
		let (events_tx, _) = broadcast::channel(256);
		let record = Arc::new(SessionRecord {
			session_id: session_id.clone(),
			service_name,
			instance_name,
			metadata,
			connected_at: Instant::now(),
			last_activity: RwLock::new(Instant::now()),
			active_route_ids: RwLock::new(Vec::new()),
		});
		let entry = Arc::new(SessionEntry {
			record,
			staging: RwLock::new(Staging::new()),
			events: events_tx,
			connected: std::sync::atomic::AtomicBool::new(true),
		});
		self.sessions.write().insert(session_id.clone(), entry);
		info!(%session_id, "session registered");
		session_id
	}

	fn get(&self, id: &str) -> Option<Arc<SessionEntry>> {
		self.sessions.read().get(id).cloned()
	}

	/// Marks a session disconnected and schedules it for removal after the grace window,
	/// unless a `RECONNECT` arrives first.
	fn on_disconnect(self: &Arc<Self>, id: SessionId, joinset: &mut tokio::task::JoinSet<()>) {
		let Some(entry) = self.get(&id) else { return };
		entry.connected.store(false, std::sync::atomic::Ordering::SeqCst);
		let this = self.clone();
		let grace = self.cfg.grace_window;
		joinset.spawn(async move {
			tokio::time::sleep(grace).await;
			let still_gone = this
				.get(&id)
				.is_some_and(|e| !e.connected.load(std::sync::atomic::Ordering::SeqCst));
			if still_gone {
				this.expire_session(&id);
			}
		});
	}

	fn expire_session(&self, id: &SessionId) {
		if self.sessions.write().remove(id).is_some() {
			let removed = self.routing.purge_session(id);
			info!(session_id = %id, routes_removed = removed.len(), "session expired, routes purged");
		}
	}

	fn shutdown_session(&self, id: &SessionId) {
		if self.sessions.write().remove(id).is_some() {
			let removed = self.routing.purge_session(id);
			info!(session_id = %id, routes_removed = removed.len(), "session shut down explicitly");
		}
	}

	fn reconnect(&self, id: &str) -> bool {
		if let Some(entry) = self.get(id) {
			entry.connected.store(true, std::sync::atomic::Ordering::SeqCst);
			entry.record.touch();
			true
		} else {
			false
		}
	}

	/// Validates the session's staging area against the spec's structural checks.
	fn validate(&self, entry: &SessionEntry) -> Result<(), String> {
		let staging = entry.staging.read();
		let staged_ids: std::collections::HashSet<&RouteId> = staging
			.ops
			.iter()
			.filter_map(|op| match op {
				StagedOp::Add { route_id, .. } => Some(route_id),
				_ => None,
			})
			.collect();
		for op in &staging.ops {
			match op {
				StagedOp::Add { domains, path_prefix, backend_url, .. } => {
					if domains.is_empty() {
						return Err("route has no domains".to_string());
					}
					if !path_prefix.starts_with('/') {
						return Err(format!("path_prefix {path_prefix} must start with /"));
					}
					let scheme_ok = ["http://", "https://", "ws://", "wss://"]
						.iter()
						.any(|s| backend_url.starts_with(s));
					if !scheme_ok {
						return Err(format!("backend_url {backend_url} has unsupported scheme"));
					}
				},
				StagedOp::Remove { route_id }
				| StagedOp::HeadersSet { target: Target::One(route_id), .. }
				| StagedOp::HeadersRemove { target: Target::One(route_id), .. }
				| StagedOp::OptionsSet { target: Target::One(route_id), .. } => {
					let active = self.routing.all().iter().any(|r| &r.route_id == route_id);
					if !active && !staged_ids.contains(route_id) {
						return Err(format!("route_id {route_id} is neither active nor staged"));
					}
				},
				_ => {},
			}
		}
		Ok(())
	}

	/// Applies the staged change-set atomically: the routing-table change is built and
	/// validated first, and only once that validation succeeds are the session's own
	/// bookkeeping (`active_route_ids`) and direct backend-state mutations (health,
	/// circuit-breaker thresholds) applied alongside the commit. A validation failure
	/// therefore leaves every piece of state exactly as it was.
	fn apply(self: &Arc<Self>, session_id: &SessionId, entry: &SessionEntry) -> Result<usize, String> {
		self.validate(entry)?;
		let mut staging = entry.staging.write();
		let mut change = self.routing.stage();
		let existing = self.routing.all();
		let ops: Vec<StagedOp> = staging.ops.drain(..).collect();
		let applied = ops.len();

		let mut route_id_adds: Vec<RouteId> = Vec::new();
		let mut route_id_removes: Vec<RouteId> = Vec::new();
		let mut health_ops: Vec<(Arc<Route>, bool)> = Vec::new();
		let mut breaker_ops: Vec<(Arc<Route>, CircuitBreakerThresholds)> = Vec::new();

		for op in ops {
			match op {
				StagedOp::Add { route_id, domains, path_prefix, backend_url, priority } => {
					change.add(Route {
						route_id: route_id.clone(),
						domains,
						path_prefix,
						backend_url,
						priority,
						request_headers: HeaderPolicy::default(),
						response_headers: HeaderPolicy::default(),
						options: RouteOptions::default(),
						owner_session: Some(session_id.clone()),
						insertion_order: 0,
						backend_state: Arc::new(BackendState::new(CircuitBreakerThresholds::default())),
					});
					route_id_adds.push(route_id);
				},
				StagedOp::Remove { route_id } => {
					change.remove(route_id.clone());
					route_id_removes.push(route_id);
				},
				StagedOp::HeadersSet { target, add, to_response } => {
					for route in targets(&existing, session_id, &target) {
						let mut cloned = (*route).clone();
						let policy = if to_response { &mut cloned.response_headers } else { &mut cloned.request_headers };
						policy.add.extend(add.clone());
						change.remove(route.route_id.clone());
						change.add(cloned);
					}
				},
				StagedOp::HeadersRemove { target, names, to_response } => {
					for route in targets(&existing, session_id, &target) {
						let mut cloned = (*route).clone();
						let policy = if to_response { &mut cloned.response_headers } else { &mut cloned.request_headers };
						policy.remove.extend(names.clone());
						change.remove(route.route_id.clone());
						change.add(cloned);
					}
				},
				StagedOp::OptionsSet { target, options } => {
					for route in targets(&existing, session_id, &target) {
						let mut cloned = (*route).clone();
						cloned.options = options.clone();
						change.remove(route.route_id.clone());
						change.add(cloned);
					}
				},
				StagedOp::OptionsRemove { target } => {
					for route in targets(&existing, session_id, &target) {
						let mut cloned = (*route).clone();
						cloned.options = RouteOptions::default();
						change.remove(route.route_id.clone());
						change.add(cloned);
					}
				},
				StagedOp::HealthSet { target, healthy } => {
					for route in targets(&existing, session_id, &target) {
						health_ops.push((route, healthy));
					}
				},
				StagedOp::RateLimitSet { target, rps } => {
					for route in targets(&existing, session_id, &target) {
						let mut cloned = (*route).clone();
						cloned.options.rate_limit_rps = rps;
						change.remove(route.route_id.clone());
						change.add(cloned);
					}
				},
				StagedOp::CircuitBreakerSet { target, thresholds } => {
					for route in targets(&existing, session_id, &target) {
						breaker_ops.push((route, thresholds));
					}
				},
			}
		}

		change.validate().map_err(|e| e.to_string())?;
		change.commit();

		if !route_id_adds.is_empty() || !route_id_removes.is_empty() {
			let mut active = entry.record.active_route_ids.write();
			active.extend(route_id_adds);
			active.retain(|id| !route_id_removes.contains(id));
		}
		for (route, healthy) in health_ops {
			if healthy {
				route.backend_state.exit_maintenance();
			} else {
				route.backend_state.enter_maintenance(None);
			}
		}
		for (route, thresholds) in breaker_ops {
			route.backend_state.set_thresholds(thresholds);
		}

		Ok(applied)
	}

	/// Broadcasts a `SHUTDOWN` event line to every connected session, used when the gateway
	/// begins a coordinated drain so control-plane clients can stop issuing commands.
	pub fn broadcast_shutdown(&self) {
		for entry in self.sessions.read().values() {
			let _ = entry.events.send("SHUTDOWN".to_string());
		}
	}

	fn rollback(&self, entry: &SessionEntry) {
		entry.staging.write().ops.clear();
	}

	/// Sweeps every session's staging area for idle timeout, discarding (not disconnecting).
	pub fn sweep_idle_staging(&self) {
		for entry in self.sessions.read().values() {
			let mut staging = entry.staging.write();
			if !staging.ops.is_empty() && staging.last_touched.elapsed() > self.cfg.staging_idle_timeout {
				staging.ops.clear();
				debug!(session_id = %entry.record.session_id, "staging area auto-discarded after idle timeout");
			}
		}
	}

	pub fn active_session_count(&self) -> usize {
		self.sessions.read().len()
	}
}

fn parse_target(s: &str) -> Target {
	if s == "ALL" { Target::All } else { Target::One(Strng::from(s)) }
}

fn targets<'a>(all: &'a [Arc<Route>], session_id: &SessionId, target: &Target) -> Vec<Arc<Route>> {
	match target {
		Target::All => all.iter().filter(|r| r.owner_session.as_ref() == Some(session_id)).cloned().collect(),
		Target::One(id) => all.iter().filter(|r| &r.route_id == id).cloned().collect(),
	}
}

/// Runs the control-plane TCP listener until the drain signal fires.
pub async fn serve(manager: Arc<SessionManager>, listener: TcpListener, drain: DrainWatcher) {
	let mut joinset = tokio::task::JoinSet::new();
	loop {
		tokio::select! {
			biased;
			_ = drain.clone().wait_for_drain() => {
				info!("control-plane listener shutting down");
				break;
			}
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						let _ = stream.set_nodelay(true);
						let manager = manager.clone();
						joinset.spawn(async move {
							if let Err(e) = handle_connection(manager, stream).await {
								debug!(%peer, error = %e, "control connection closed");
							}
						});
					},
					Err(e) => warn!(error = %e, "control-plane accept failed"),
				}
			}
		}
	}
	joinset.shutdown().await;
}

async fn handle_connection(manager: Arc<SessionManager>, stream: TcpStream) -> anyhow::Result<()> {
	let (read_half, mut write_half) = stream.into_split();
	let mut lines = BufReader::new(read_half).lines();
	let mut bound_session: Option<SessionId> = None;
	let mut event_rx: Option<broadcast::Receiver<String>> = None;
	let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

	loop {
		tokio::select! {
			line = lines.next_line() => {
				let Some(line) = line? else { break };
				if line.len() > MAX_COMMAND_LINE {
					out_tx.send("ERROR|bad format".to_string()).await.ok();
					continue;
				}
				let reply = dispatch(&manager, &line, &mut bound_session, &mut event_rx).await;
				out_tx.send(reply).await.ok();
			}
			Some(ev) = async {
				match &mut event_rx {
					Some(rx) => rx.recv().await.ok(),
					None => std::future::pending().await,
				}
			} => {
				out_tx.send(ev).await.ok();
			}
			Some(msg) = out_rx.recv() => {
				write_half.write_all(msg.as_bytes()).await?;
				write_half.write_all(b"\n").await?;
			}
		}
	}

	let mut joinset = tokio::task::JoinSet::new();
	if let Some(id) = bound_session {
		manager.on_disconnect(id, &mut joinset);
	}
	Ok(())
}

async fn dispatch(
	manager: &Arc<SessionManager>,
	line: &str,
	bound_session: &mut Option<SessionId>,
	event_rx: &mut Option<broadcast::Receiver<String>>,
) -> String {
	let parts: Vec<&str> = line.split('|').collect();
	let Some(&cmd) = parts.first() else {
		return "ERROR|bad format".to_string();
	};

	if cmd == "PING" {
		return "PONG".to_string();
	}
	if cmd == "REGISTER" {
		let [service, instance, _maint_port, metadata_json] = parts.get(1..5).unwrap_or_default() else {
			return "ERROR|bad format".to_string();
		};
		let metadata: HashMap<String, String> = serde_json::from_str(metadata_json).unwrap_or_default();
		let id = manager.register(Strng::from(*service), Strng::from(*instance), metadata);
		*bound_session = Some(id.clone());
		return format!("ACK|{id}");
	}
	if cmd == "RECONNECT" {
		let Some(id) = parts.get(1) else { return "ERROR|bad format".to_string() };
		return if manager.reconnect(id) {
			*bound_session = Some(Strng::from(*id));
			"OK".to_string()
		} else {
			"REREGISTER".to_string()
		};
	}

	// Every other command carries the session id as its first argument.
	let Some(session_id) = parts.get(1) else {
		return "ERROR|bad format".to_string();
	};
	let Some(entry) = manager.get(session_id) else {
		return "ERROR|invalid session".to_string();
	};
	entry.record.touch();
	let session_id: SessionId = Strng::from(*session_id);

	match cmd {
		"ROUTE_ADD" => {
			let [domains, path_prefix, backend_url, priority] = parts.get(2..6).unwrap_or_default() else {
				return "ERROR|bad format".to_string();
			};
			let Ok(priority) = priority.parse::<i32>() else {
				return "ERROR|bad format".to_string();
			};
			let mut staging = entry.staging.write();
			staging.route_id_counter += 1;
			let route_id: RouteId = format!("{session_id}-route-{}", staging.route_id_counter).into();
			staging.ops.push(StagedOp::Add {
				route_id: route_id.clone(),
				domains: domains.split(',').map(Strng::from).collect(),
				path_prefix: Strng::from(*path_prefix),
				backend_url: Strng::from(*backend_url),
				priority,
			});
			staging.touch();
			format!("OK|{route_id}")
		},
		"ROUTE_REMOVE" => {
			let Some(route_id) = parts.get(2) else { return "ERROR|bad format".to_string() };
			let mut staging = entry.staging.write();
			staging.ops.push(StagedOp::Remove { route_id: Strng::from(*route_id) });
			staging.touch();
			"OK".to_string()
		},
		"ROUTE_ADD_BULK" => {
			let Some(routes_json) = parts.get(2) else { return "ERROR|bad format".to_string() };
			let Ok(specs) = serde_json::from_str::<Vec<(String, String, String, i32)>>(routes_json) else {
				return "ERROR|bad format".to_string();
			};
			let mut staging = entry.staging.write();
			let mut ids = Vec::with_capacity(specs.len());
			for (domains, path_prefix, backend_url, priority) in specs {
				staging.route_id_counter += 1;
				let route_id: RouteId = format!("{session_id}-route-{}", staging.route_id_counter).into();
				staging.ops.push(StagedOp::Add {
					route_id: route_id.clone(),
					domains: domains.split(',').map(Strng::from).collect(),
					path_prefix: Strng::from(path_prefix),
					backend_url: Strng::from(backend_url),
					priority,
				});
				ids.push(route_id.to_string());
			}
			staging.touch();
			format!("OK|{}", ids.join(","))
		},
		"ROUTE_UPDATE" => {
			let [route_id, domains, path_prefix, backend_url, priority] = parts.get(2..7).unwrap_or_default() else {
				return "ERROR|bad format".to_string();
			};
			let Ok(priority) = priority.parse::<i32>() else {
				return "ERROR|bad format".to_string();
			};
			let mut staging = entry.staging.write();
			staging.ops.push(StagedOp::Remove { route_id: Strng::from(*route_id) });
			staging.ops.push(StagedOp::Add {
				route_id: Strng::from(*route_id),
				domains: domains.split(',').map(Strng::from).collect(),
				path_prefix: Strng::from(*path_prefix),
				backend_url: Strng::from(*backend_url),
				priority,
			});
			staging.touch();
			"OK".to_string()
		},
		"HEADERS_SET" => {
			let [target, direction, list] = parts.get(2..5).unwrap_or_default() else {
				return "ERROR|bad format".to_string();
			};
			let mut staging = entry.staging.write();
			staging.ops.push(StagedOp::HeadersSet {
				target: parse_target(target),
				add: parse_header_list(list),
				to_response: *direction == "response",
			});
			staging.touch();
			"OK".to_string()
		},
		"HEADERS_REMOVE" => {
			let [target, direction, names] = parts.get(2..5).unwrap_or_default() else {
				return "ERROR|bad format".to_string();
			};
			let mut staging = entry.staging.write();
			staging.ops.push(StagedOp::HeadersRemove {
				target: parse_target(target),
				names: names.split(',').filter(|s| !s.is_empty()).map(Strng::from).collect(),
				to_response: *direction == "response",
			});
			staging.touch();
			"OK".to_string()
		},
		"OPTIONS_SET" => {
			let [target, options_json] = parts.get(2..4).unwrap_or_default() else {
				return "ERROR|bad format".to_string();
			};
			let Ok(options) = serde_json::from_str::<RouteOptions>(options_json) else {
				return "ERROR|bad format".to_string();
			};
			let mut staging = entry.staging.write();
			staging.ops.push(StagedOp::OptionsSet { target: parse_target(target), options });
			staging.touch();
			"OK".to_string()
		},
		"OPTIONS_REMOVE" => {
			let Some(target) = parts.get(2) else { return "ERROR|bad format".to_string() };
			let mut staging = entry.staging.write();
			staging.ops.push(StagedOp::OptionsRemove { target: parse_target(target) });
			staging.touch();
			"OK".to_string()
		},
		"HEALTH_SET" => {
			let [target, healthy] = parts.get(2..4).unwrap_or_default() else {
				return "ERROR|bad format".to_string();
			};
			let mut staging = entry.staging.write();
			staging.ops.push(StagedOp::HealthSet { target: parse_target(target), healthy: *healthy == "up" });
			staging.touch();
			"OK".to_string()
		},
		"RATELIMIT_SET" => {
			let [target, rps] = parts.get(2..4).unwrap_or_default() else {
				return "ERROR|bad format".to_string();
			};
			let rps = if *rps == "none" { None } else { rps.parse::<u32>().ok() };
			let mut staging = entry.staging.write();
			staging.ops.push(StagedOp::RateLimitSet { target: parse_target(target), rps });
			staging.touch();
			"OK".to_string()
		},
		"CIRCUIT_BREAKER_SET" => {
			let [target, failure_threshold, success_threshold, open_timeout_secs] = parts.get(2..6).unwrap_or_default()
			else {
				return "ERROR|bad format".to_string();
			};
			let (Ok(failure_threshold), Ok(success_threshold), Ok(open_timeout_secs)) =
				(failure_threshold.parse::<u32>(), success_threshold.parse::<u32>(), open_timeout_secs.parse::<u64>())
			else {
				return "ERROR|bad format".to_string();
			};
			let mut staging = entry.staging.write();
			staging.ops.push(StagedOp::CircuitBreakerSet {
				target: parse_target(target),
				thresholds: CircuitBreakerThresholds {
					failure_threshold,
					success_threshold,
					open_timeout: Duration::from_secs(open_timeout_secs),
				},
			});
			staging.touch();
			"OK".to_string()
		},
		"CIRCUIT_BREAKER_RESET" => {
			let Some(route_id) = parts.get(2) else { return "ERROR|bad format".to_string() };
			for route in resolve_target(manager, &session_id, route_id) {
				route.backend_state.reset_circuit();
			}
			"ACK".to_string()
		},
		"DRAIN_STATUS" => {
			let Some(route_id) = parts.get(2) else { return "ERROR|bad format".to_string() };
			match manager.routing.all().into_iter().find(|r| r.route_id.as_str() == *route_id) {
				Some(route) => format!(
					"OK|{}|{:.3}",
					route.backend_state.is_draining(),
					route.backend_state.drain_progress()
				),
				None => "ERROR|unknown route".to_string(),
			}
		},
		"STATS_GET" => {
			let routes = manager.routing.all();
			let stats: Vec<_> = routes
				.iter()
				.map(|r| (r.route_id.to_string(), r.backend_state.stats()))
				.collect();
			serde_json::to_string(&stats).map(|j| format!("OK|{j}")).unwrap_or_else(|_| "ERROR|encode".to_string())
		},
		"BACKEND_TEST" => {
			let Some(url) = parts.get(2) else { return "ERROR|bad format".to_string() };
			backend_test(url).await
		},
		"CONFIG_VALIDATE" => match manager.validate(&entry) {
			Ok(()) => "OK".to_string(),
			Err(e) => format!("ERROR|{e}"),
		},
		"CONFIG_APPLY" => match manager.apply(&session_id, &entry) {
			Ok(n) => format!("OK|{n}"),
			Err(e) => format!("ERROR|{e}"),
		},
		"CONFIG_APPLY_PARTIAL" => {
			// Partial apply commits the full staged set in one pass; the staging model has
			// no ordering dependency between ops, so a partial subset is not meaningfully
			// different from a full apply.
			match manager.apply(&session_id, &entry) {
				Ok(n) => format!("OK|{n}"),
				Err(e) => format!("ERROR|{e}"),
			}
		},
		"CONFIG_DIFF" => {
			let staging = entry.staging.read();
			format!("OK|{}", staging.ops.len())
		},
		"CONFIG_ROLLBACK" => {
			manager.rollback(&entry);
			"OK".to_string()
		},
		"MAINT_ENTER" => {
			let Some(target) = parts.get(2) else { return "ERROR|bad format".to_string() };
			let redirect = parts.get(3).filter(|s| !s.is_empty()).map(|s| Strng::from(*s));
			for route in resolve_target(manager, &session_id, target) {
				route.backend_state.enter_maintenance(redirect.clone());
			}
			let _ = entry.events.send(format!("MAINT_OK|{target}"));
			"ACK".to_string()
		},
		"MAINT_EXIT" => {
			let Some(target) = parts.get(2) else { return "ERROR|bad format".to_string() };
			for route in resolve_target(manager, &session_id, target) {
				route.backend_state.exit_maintenance();
			}
			let _ = entry.events.send(format!("MAINT_OK|{target}"));
			"ACK".to_string()
		},
		"DRAIN_START" => {
			let Some(route_id) = parts.get(2) else { return "ERROR|bad format".to_string() };
			let Some(duration_secs) = parts.get(3).and_then(|s| s.parse::<u64>().ok()) else {
				return "ERROR|bad format".to_string();
			};
			for route in resolve_target(manager, &session_id, route_id) {
				route.backend_state.start_drain(Duration::from_secs(duration_secs));
			}
			"ACK".to_string()
		},
		"DRAIN_CANCEL" => {
			let Some(route_id) = parts.get(2) else { return "ERROR|bad format".to_string() };
			for route in resolve_target(manager, &session_id, route_id) {
				route.backend_state.cancel_drain();
			}
			"ACK".to_string()
		},
		"CIRCUIT_BREAKER_STATUS" => {
			let Some(route_id) = parts.get(2) else { return "ERROR|bad format".to_string() };
			match manager.routing.all().into_iter().find(|r| r.route_id.as_str() == *route_id) {
				Some(route) => serde_json::to_string(&route.backend_state.stats())
					.map(|j| format!("OK|{j}"))
					.unwrap_or_else(|_| "ERROR|encode".to_string()),
				None => "ERROR|unknown route".to_string(),
			}
		},
		"SESSION_INFO" => format!(
			"OK|{}|{}|{}",
			entry.record.service_name,
			entry.record.instance_name,
			entry.record.active_route_ids.read().len()
		),
		"SUBSCRIBE" => {
			*event_rx = Some(entry.events.subscribe());
			"OK".to_string()
		},
		"UNSUBSCRIBE" => {
			*event_rx = None;
			"OK".to_string()
		},
		"CLIENT_SHUTDOWN" => {
			manager.shutdown_session(&session_id);
			"OK".to_string()
		},
		_ => "ERROR|unknown command".to_string(),
	}
}

fn resolve_target(manager: &Arc<SessionManager>, session_id: &SessionId, target: &str) -> Vec<Arc<Route>> {
	let all = manager.routing.all();
	if target == "ALL" {
		all.into_iter().filter(|r| r.owner_session.as_ref() == Some(session_id)).collect()
	} else {
		let ids: std::collections::HashSet<&str> = target.split(',').collect();
		all.into_iter().filter(|r| ids.contains(r.route_id.as_str())).collect()
	}
}

/// A probe request used to back `BACKEND_TEST`: single GET with a short deadline.
pub async fn backend_test(url: &str) -> String {
	let started = Instant::now();
	let client: hyper_util::client::legacy::Client<_, http_body_util::Empty<Bytes>> =
		hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
	let Ok(uri) = url.parse::<http::Uri>() else {
		return "ERROR|invalid url".to_string();
	};
	let req = match http::Request::get(uri).body(http_body_util::Empty::new()) {
		Ok(r) => r,
		Err(e) => return format!("ERROR|{e}"),
	};
	match tokio::time::timeout(Duration::from_secs(5), client.request(req)).await {
		Ok(Ok(resp)) => format!("OK|{}|{}ms", resp.status().as_u16(), started.elapsed().as_millis()),
		Ok(Err(e)) => format!("ERROR|{e}"),
		Err(_) => "ERROR|timeout".to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::routing::Blackhole;

	fn manager() -> Arc<SessionManager> {
		SessionManager::new(RoutingTable::new(Blackhole(false)), SessionManagerConfig::default())
	}

	#[test]
	fn register_then_route_lifecycle() {
		let mgr = manager();
		let id = mgr.register("svc".into(), "inst".into(), HashMap::new());
		let entry = mgr.get(&id).unwrap();
		{
			let mut staging = entry.staging.write();
			staging.ops.push(StagedOp::Add {
				route_id: "r1".into(),
				domains: vec!["example.com".into()],
				path_prefix: "/".into(),
				backend_url: "http://127.0.0.1:9000".into(),
				priority: 0,
			});
		}
		assert!(mgr.validate(&entry).is_ok());
		let applied = mgr.apply(&id, &entry).unwrap();
		assert_eq!(applied, 1);
		assert!(mgr.routing.find("example.com", "/").is_some());
	}

	#[test]
	fn invalid_backend_scheme_fails_validation() {
		let mgr = manager();
		let id = mgr.register("svc".into(), "inst".into(), HashMap::new());
		let entry = mgr.get(&id).unwrap();
		entry.staging.write().ops.push(StagedOp::Add {
			route_id: "r1".into(),
			domains: vec!["example.com".into()],
			path_prefix: "/".into(),
			backend_url: "ftp://127.0.0.1".into(),
			priority: 0,
		});
		assert!(mgr.validate(&entry).is_err());
	}

	#[test]
	fn expiring_a_session_purges_its_routes() {
		let mgr = manager();
		let id = mgr.register("svc".into(), "inst".into(), HashMap::new());
		let entry = mgr.get(&id).unwrap();
		entry.staging.write().ops.push(StagedOp::Add {
			route_id: "r1".into(),
			domains: vec!["example.com".into()],
			path_prefix: "/".into(),
			backend_url: "http://127.0.0.1:9000".into(),
			priority: 0,
		});
		mgr.apply(&id, &entry).unwrap();
		mgr.expire_session(&id);
		assert!(mgr.routing.find("example.com", "/").is_none());
	}

	#[test]
	fn unknown_session_id_is_rejected() {
		let mgr = manager();
		assert!(mgr.get("nonexistent").is_none());
	}

	#[test]
	fn apply_leaves_no_trace_when_routing_validation_fails() {
		let mgr = manager();
		let id_a = mgr.register("svc-a".into(), "inst".into(), HashMap::new());
		let entry_a = mgr.get(&id_a).unwrap();
		entry_a.staging.write().ops.push(StagedOp::Add {
			route_id: "r1".into(),
			domains: vec!["example.com".into()],
			path_prefix: "/".into(),
			backend_url: "http://127.0.0.1:9000".into(),
			priority: 0,
		});
		mgr.apply(&id_a, &entry_a).unwrap();

		let id_b = mgr.register("svc-b".into(), "inst".into(), HashMap::new());
		let entry_b = mgr.get(&id_b).unwrap();
		entry_b.staging.write().ops.push(StagedOp::Add {
			route_id: "r2".into(),
			domains: vec!["example.com".into()],
			path_prefix: "/".into(),
			backend_url: "http://127.0.0.1:9001".into(),
			priority: 0,
		});
		let err = mgr.apply(&id_b, &entry_b);
		assert!(err.is_err());
		// The conflicting route must not have been registered against the session that
		// attempted to add it: no partial mutation survives a failed commit.
		assert!(entry_b.record.active_route_ids.read().is_empty());
		assert_eq!(mgr.routing.all().len(), 1);
	}

	#[test]
	fn maint_enter_emits_maint_ok_event_to_subscribers() {
		let mgr = manager();
		let id = mgr.register("svc".into(), "inst".into(), HashMap::new());
		let entry = mgr.get(&id).unwrap();
		entry.staging.write().ops.push(StagedOp::Add {
			route_id: "r1".into(),
			domains: vec!["example.com".into()],
			path_prefix: "/".into(),
			backend_url: "http://127.0.0.1:9000".into(),
			priority: 0,
		});
		mgr.apply(&id, &entry).unwrap();

		let mut rx = entry.events.subscribe();
		for route in resolve_target(&mgr, &id, "ALL") {
			route.backend_state.enter_maintenance(None);
		}
		entry.events.send("MAINT_OK|ALL".to_string()).unwrap();
		assert_eq!(rx.try_recv().unwrap(), "MAINT_OK|ALL");
	}

	#[test]
	fn broadcast_shutdown_reaches_every_session() {
		let mgr = manager();
		let id = mgr.register("svc".into(), "inst".into(), HashMap::new());
		let entry = mgr.get(&id).unwrap();
		let mut rx = entry.events.subscribe();
		mgr.broadcast_shutdown();
		assert_eq!(rx.try_recv().unwrap(), "SHUTDOWN");
	}
}
