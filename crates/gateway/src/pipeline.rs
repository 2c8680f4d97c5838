//! Request Pipeline: route match, suppression check, header rewriting, upstream dispatch
//! with retry, optional response compression, and response streaming under a body-size cap.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use rand::Rng;
use tracing::{debug, warn};

use crate::client::UpstreamClient;
use crate::compression;
use crate::http::{Request, Response, TimeoutBody, boxed, empty_body, full_body, to_bytes};
use crate::routing::RoutingTable;
use crate::types::{HeaderPolicy, Route, Suppression};
use crate::workerpool::{Tier, WorkerPool};

const DEFAULT_MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;
const DEFAULT_MAX_RESPONSE_BODY: usize = 10 * 1024 * 1024;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const WEBSOCKET_MAX_DURATION: Duration = Duration::from_secs(3600);
const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_REAL_IP: &str = "x-real-ip";
const X_MAINTENANCE_MODE: &str = "x-maintenance-mode";
const X_DRAIN_MODE: &str = "x-drain-mode";

/// The socket the inbound connection was accepted from, stashed in request extensions by the
/// listener so the pipeline can inject `X-Forwarded-For`/`X-Real-IP` without threading the
/// value through every call.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

pub struct Pipeline {
	routing: Arc<RoutingTable>,
	client: UpstreamClient,
	workers: Arc<WorkerPool>,
}

/// What happened to a request, handed off to the worker pool for async access logging.
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
	pub route_id: Option<String>,
	pub method: String,
	pub path: String,
	pub status: u16,
	pub duration: Duration,
	pub suppression: Option<Suppression>,
}

impl Pipeline {
	pub fn new(routing: Arc<RoutingTable>, client: UpstreamClient, workers: Arc<WorkerPool>) -> Self {
		Self { routing, client, workers }
	}

	/// Handles one inbound request. Returns `None` when the route table is configured to
	/// blackhole unmatched traffic, signalling the caller to drop the connection rather than
	/// write any response.
	pub async fn handle(&self, mut req: Request) -> Option<Response> {
		let started = std::time::Instant::now();
		let method = req.method().to_string();
		let path = req.uri().path().to_string();
		let client_addr = req.extensions().get::<ClientAddr>().copied();
		let request_id = existing_request_id(req.headers()).unwrap_or_else(new_request_id);

		let host = normalize_host(&host_of(&req));
		let Some(route) = self.routing.find(&host, req.uri().path()) else {
			if self.routing.is_blackhole() {
				debug!(%host, path, "no matching route, blackholing connection");
				self.log(AccessLogEntry { route_id: None, method, path, status: 0, duration: started.elapsed(), suppression: None });
				return None;
			}
			let resp = ensure_request_id(not_found(), &request_id);
			self.log(AccessLogEntry { route_id: None, method, path, status: resp.status().as_u16(), duration: started.elapsed(), suppression: None });
			return Some(resp);
		};

		if let Some(suppression) = route.backend_state.check(rand::rng().random_range(0.0..1.0)) {
			let resp = self.suppression_response(req, &route, suppression, client_addr, &request_id).await;
			let resp = ensure_request_id(resp, &request_id);
			self.log(AccessLogEntry {
				route_id: Some(route.route_id.to_string()),
				method,
				path,
				status: resp.status().as_u16(),
				duration: started.elapsed(),
				suppression: Some(suppression),
			});
			return Some(resp);
		}

		if let Some(upgrade_type) = websocket_upgrade_requested(req.headers()) {
			if !route.options.websocket {
				let resp = ensure_request_id(error_response(StatusCode::BAD_REQUEST, "websocket upgrade not permitted on this route"), &request_id);
				self.log(AccessLogEntry {
					route_id: Some(route.route_id.to_string()),
					method,
					path,
					status: resp.status().as_u16(),
					duration: started.elapsed(),
					suppression: None,
				});
				return Some(resp);
			}
			let resp = self.dispatch_websocket(req, &route, upgrade_type, client_addr, &request_id).await;
			let resp = ensure_request_id(resp, &request_id);
			self.log(AccessLogEntry {
				route_id: Some(route.route_id.to_string()),
				method,
				path,
				status: resp.status().as_u16(),
				duration: started.elapsed(),
				suppression: None,
			});
			return Some(resp);
		}

		let resp = self.dispatch(req, &route, route.backend_url.as_str(), client_addr, &request_id).await;
		let resp = ensure_request_id(resp, &request_id);
		self.log(AccessLogEntry {
			route_id: Some(route.route_id.to_string()),
			method,
			path,
			status: resp.status().as_u16(),
			duration: started.elapsed(),
			suppression: None,
		});
		Some(resp)
	}

	async fn suppression_response(&self, req: Request, route: &Arc<Route>, suppression: Suppression, client_addr: Option<ClientAddr>, request_id: &str) -> Response {
		match suppression {
			Suppression::CircuitOpen => error_response(StatusCode::SERVICE_UNAVAILABLE, "backend circuit open"),
			Suppression::DrainRejected => {
				route.backend_state.record_drain_rejection();
				with_retry_after(error_response(StatusCode::SERVICE_UNAVAILABLE, "backend draining"), X_DRAIN_MODE, 60)
			},
			Suppression::Maintenance => {
				route.backend_state.record_maintenance_hit();
				if let Some(redirect) = route.backend_state.maintenance_redirect() {
					let resp = self.dispatch(req, route, redirect.as_str(), client_addr, request_id).await;
					with_retry_after(resp, X_MAINTENANCE_MODE, 300)
				} else {
					with_retry_after(error_response(StatusCode::SERVICE_UNAVAILABLE, "under maintenance"), X_MAINTENANCE_MODE, 300)
				}
			},
		}
	}

	async fn dispatch(&self, req: Request, route: &Arc<Route>, backend_url: &str, client_addr: Option<ClientAddr>, request_id: &str) -> Response {
		let max_request_body = route.options.max_request_body.unwrap_or(DEFAULT_MAX_REQUEST_BODY);
		let max_response_body = route.options.max_response_body.unwrap_or(DEFAULT_MAX_RESPONSE_BODY);
		let timeout = route.options.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

		let (parts, body) = req.into_parts();
		let body_bytes = match to_bytes(body, max_request_body).await {
			Ok(b) => b,
			Err(e) => {
				debug!(route = %route.route_id, error = %e, "request body too large");
				return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
			},
		};

		let accept_encoding = parts.headers.get(http::header::ACCEPT_ENCODING).cloned();
		let upstream_uri = match crate::client::rewrite_uri(backend_url, &parts.uri, Some(route.path_prefix.as_str())) {
			Ok(uri) => uri,
			Err(e) => {
				warn!(route = %route.route_id, error = %e, "failed to build upstream uri");
				return error_response(StatusCode::BAD_GATEWAY, "invalid upstream address");
			},
		};

		let attempts = route.options.retries.saturating_add(1);
		let mut backoff = backoff::ExponentialBackoffBuilder::new()
			.with_initial_interval(Duration::from_millis(50))
			.with_max_interval(Duration::from_millis(500))
			.build();

		let mut last_err = None;
		for attempt in 0..attempts {
			let mut upstream_req = Request::builder().method(parts.method.clone()).uri(upstream_uri.clone()).version(parts.version);
			*upstream_req.headers_mut().unwrap() = parts.headers.clone();
			apply_header_policy(upstream_req.headers_mut().unwrap(), &route.request_headers, client_addr);
			inject_forwarding_headers(upstream_req.headers_mut().unwrap(), client_addr, request_id);
			let upstream_req = match upstream_req.body(full_body(body_bytes.clone())) {
				Ok(r) => r,
				Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
			};

			let fut = self.client.request(upstream_req);
			let result = tokio::time::timeout(timeout, fut).await;
			match result {
				Ok(Ok(resp)) if should_retry(resp.status(), attempt, attempts) => {
					route.backend_state.on_failure();
					last_err = Some(format!("upstream returned {}", resp.status()));
					if let Some(delay) = backoff.next_backoff() {
						tokio::time::sleep(delay).await;
					}
					continue;
				},
				Ok(Ok(resp)) => {
					route.backend_state.on_success();
					return self.finish_response(resp, max_response_body, accept_encoding.as_ref(), route).await;
				},
				Ok(Err(e)) => {
					route.backend_state.on_failure();
					last_err = Some(e.to_string());
				},
				Err(_) => {
					route.backend_state.on_failure();
					last_err = Some("upstream request timed out".to_string());
				},
			}
			if attempt + 1 < attempts
				&& let Some(delay) = backoff.next_backoff()
			{
				tokio::time::sleep(delay).await;
			}
		}

		warn!(route = %route.route_id, error = ?last_err, "upstream dispatch exhausted retries");
		error_response(StatusCode::BAD_GATEWAY, last_err.as_deref().unwrap_or("upstream unreachable"))
	}

	async fn dispatch_websocket(&self, mut req: Request, route: &Arc<Route>, upgrade_type: HeaderValue, client_addr: Option<ClientAddr>, request_id: &str) -> Response {
		let upstream_uri = match crate::client::rewrite_uri(route.backend_url.as_str(), req.uri(), Some(route.path_prefix.as_str())) {
			Ok(uri) => uri,
			Err(e) => {
				warn!(route = %route.route_id, error = %e, "failed to build upstream uri for websocket upgrade");
				return error_response(StatusCode::BAD_GATEWAY, "invalid upstream address");
			},
		};

		let Some(client_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
			return error_response(StatusCode::BAD_REQUEST, "connection does not support upgrades");
		};

		let method = req.method().clone();
		let version = req.version();
		let mut headers = req.headers().clone();
		apply_header_policy(&mut headers, &route.request_headers, client_addr);
		inject_forwarding_headers(&mut headers, client_addr, request_id);
		headers.insert(http::header::CONNECTION, HeaderValue::from_static("upgrade"));
		headers.insert(http::header::UPGRADE, upgrade_type.clone());

		let mut builder = Request::builder().method(method).uri(upstream_uri).version(version);
		*builder.headers_mut().unwrap() = headers;
		let upstream_req = match builder.body(empty_body()) {
			Ok(r) => r,
			Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
		};

		let mut resp = match self.client.request(upstream_req).await {
			Ok(r) => r,
			Err(e) => {
				route.backend_state.on_failure();
				warn!(route = %route.route_id, error = %e, "websocket upstream dispatch failed");
				return error_response(StatusCode::BAD_GATEWAY, "upstream unreachable");
			},
		};

		if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
			route.backend_state.on_failure();
			return resp;
		}

		let resp_upgrade_type = resp.headers().get(http::header::UPGRADE).cloned();
		if resp_upgrade_type.as_ref() != Some(&upgrade_type) {
			warn!(route = %route.route_id, "upstream responded with a mismatched upgrade type");
			return error_response(StatusCode::BAD_GATEWAY, "upstream upgrade type mismatch");
		}

		let Some(server_upgrade) = resp.extensions_mut().remove::<OnUpgrade>() else {
			return error_response(StatusCode::BAD_GATEWAY, "upstream did not offer an upgrade handle");
		};

		route.backend_state.on_success();
		let route_id = route.route_id.clone();
		tokio::spawn(async move {
			let (client_io, server_io) = match tokio::try_join!(client_upgrade, server_upgrade) {
				Ok(pair) => pair,
				Err(e) => {
					warn!(route = %route_id, error = %e, "websocket upgrade handshake failed");
					return;
				},
			};
			let mut client_io = TokioIo::new(client_io);
			let mut server_io = TokioIo::new(server_io);
			let copy = tokio::io::copy_bidirectional(&mut client_io, &mut server_io);
			match tokio::time::timeout(WEBSOCKET_MAX_DURATION, copy).await {
				Ok(Err(e)) => debug!(route = %route_id, error = %e, "websocket connection closed with error"),
				Ok(Ok(_)) => {},
				Err(_) => debug!(route = %route_id, "websocket connection exceeded max duration, closing"),
			}
		});

		resp
	}

	async fn finish_response(&self, resp: Response, max_response_body: usize, accept_encoding: Option<&HeaderValue>, route: &Arc<Route>) -> Response {
		let (mut parts, body) = resp.into_parts();
		apply_header_policy(&mut parts.headers, &route.response_headers, None);
		let body = TimeoutBody::new(Duration::from_secs(300), http_body_util::Limited::new(body, max_response_body));
		let body = boxed(body);

		let body = if should_compress(route, &parts) && let Some(encoding) = compression::negotiate(accept_encoding) {
			parts.headers.insert(http::header::CONTENT_ENCODING, compression::content_encoding_header(encoding));
			parts.headers.remove(http::header::CONTENT_LENGTH);
			compression::encode_body(encoding, body)
		} else {
			body
		};

		Response::from_parts(parts, body)
	}

	fn log(&self, entry: AccessLogEntry) {
		let analytics = entry.clone();
		self.workers.submit(
			Tier::High,
			Arc::new(move || {
				tracing::info!(
					route = entry.route_id.as_deref().unwrap_or("-"),
					method = %entry.method,
					path = %entry.path,
					status = entry.status,
					duration_ms = entry.duration.as_millis() as u64,
					suppression = ?entry.suppression,
					"request complete"
				);
			}),
		);
		self.workers.submit(
			Tier::Normal,
			Arc::new(move || {
				tracing::debug!(
					route = analytics.route_id.as_deref().unwrap_or("-"),
					status = analytics.status,
					duration_ms = analytics.duration.as_millis() as u64,
					"analytics aggregation tick"
				);
			}),
		);
	}
}

fn should_retry(status: StatusCode, attempt: u32, attempts: u32) -> bool {
	attempt + 1 < attempts && (status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS)
}

/// Gate for response compression: the route must opt in, the content-type must be in the
/// route's allowlist, and a known `Content-Length` must clear the configured floor. An unknown
/// (streamed) length is allowed through since the route already opted in by content-type.
fn should_compress(route: &Route, parts: &http::response::Parts) -> bool {
	if !route.options.compression {
		return false;
	}
	let content_type = parts.headers.get(http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("");
	let type_matches = route.options.compress_content_types.iter().any(|prefix| content_type.starts_with(prefix.as_str()));
	if !type_matches {
		return false;
	}
	match parts.headers.get(http::header::CONTENT_LENGTH).and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<usize>().ok()) {
		Some(len) => len >= route.options.compress_min_size,
		None => true,
	}
}

fn apply_header_policy(headers: &mut http::HeaderMap, policy: &HeaderPolicy, client_addr: Option<ClientAddr>) {
	for name in &policy.remove {
		if let Ok(name) = HeaderName::try_from(name.as_str()) {
			headers.remove(name);
		}
	}
	let client_ip = client_addr.map(|a| a.0.ip().to_string());
	for op in &policy.add {
		let raw = op.value.as_str();
		let value = if raw.contains("${client_ip}") { raw.replace("${client_ip}", client_ip.as_deref().unwrap_or("")) } else { raw.to_string() };
		if let (Ok(name), Ok(value)) = (HeaderName::try_from(op.name.as_str()), HeaderValue::try_from(value.as_str())) {
			headers.insert(name, value);
		}
	}
}

/// Injects the forwarding headers the upstream needs to see the original client and trace the
/// request: `X-Forwarded-For` (appended), `X-Forwarded-Proto` (always `https`, since only the
/// TLS listener ever reaches the pipeline), `X-Real-IP`, and `X-Request-ID`.
fn inject_forwarding_headers(headers: &mut http::HeaderMap, client_addr: Option<ClientAddr>, request_id: &str) {
	if let Some(ClientAddr(addr)) = client_addr {
		let ip = addr.ip().to_string();
		let xff_name = HeaderName::from_static(X_FORWARDED_FOR);
		let appended = match headers.get(&xff_name).and_then(|v| v.to_str().ok()) {
			Some(existing) if !existing.is_empty() => format!("{existing}, {ip}"),
			_ => ip.clone(),
		};
		if let Ok(v) = HeaderValue::from_str(&appended) {
			headers.insert(xff_name, v);
		}
		if let Ok(v) = HeaderValue::from_str(&ip) {
			headers.insert(HeaderName::from_static(X_REAL_IP), v);
		}
	}
	headers.insert(HeaderName::from_static(X_FORWARDED_PROTO), HeaderValue::from_static("https"));
	if let Ok(v) = HeaderValue::from_str(request_id) {
		headers.insert(HeaderName::from_static(X_REQUEST_ID), v);
	}
}

fn existing_request_id(headers: &http::HeaderMap) -> Option<String> {
	headers.get(HeaderName::from_static(X_REQUEST_ID)).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn new_request_id() -> String {
	uuid::Uuid::new_v4().to_string()
}

fn ensure_request_id(mut resp: Response, request_id: &str) -> Response {
	let name = HeaderName::from_static(X_REQUEST_ID);
	if !resp.headers().contains_key(&name)
		&& let Ok(v) = HeaderValue::from_str(request_id)
	{
		resp.headers_mut().insert(name, v);
	}
	resp
}

fn with_retry_after(mut resp: Response, mode_header: &'static str, retry_after_secs: u64) -> Response {
	resp.headers_mut().insert(HeaderName::from_static(mode_header), HeaderValue::from_static("true"));
	if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
		resp.headers_mut().insert(http::header::RETRY_AFTER, v);
	}
	resp
}

/// True when the request carries a `Connection: ...upgrade...` token, and returns the
/// requested `Upgrade` protocol (e.g. `websocket`).
fn websocket_upgrade_requested(headers: &http::HeaderMap) -> Option<HeaderValue> {
	let has_upgrade_token = headers
		.get(http::header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")));
	if !has_upgrade_token {
		return None;
	}
	headers.get(http::header::UPGRADE).cloned()
}

fn host_of(req: &Request) -> String {
	req
		.uri()
		.host()
		.map(String::from)
		.or_else(|| req.headers().get(http::header::HOST).and_then(|h| h.to_str().ok()).map(|s| s.split(':').next().unwrap_or(s).to_string()))
		.unwrap_or_default()
}

fn normalize_host(host: &str) -> String {
	crate::types::normalize_host(host)
}

fn not_found() -> Response {
	error_response(StatusCode::NOT_FOUND, "no matching route")
}

fn error_response(status: StatusCode, message: &str) -> Response {
	Response::builder().status(status).header(http::header::CONTENT_TYPE, "text/plain").body(full_body(Bytes::copy_from_slice(message.as_bytes()))).unwrap_or_else(|_| {
		let mut resp = Response::new(empty_body());
		*resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
		resp
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::routing::Blackhole;
	use crate::types::{BackendState, CircuitBreakerThresholds, Route, RouteOptions};

	fn workers() -> Arc<WorkerPool> {
		let (_trigger, watcher) = gateway_core::drain::new();
		let mut joinset = tokio::task::JoinSet::new();
		WorkerPool::start(Default::default(), watcher, &mut joinset)
	}

	#[tokio::test]
	async fn unmatched_route_returns_404() {
		let routing = RoutingTable::new(Blackhole(false));
		let client = UpstreamClient::new(Duration::from_secs(1)).unwrap();
		let pipeline = Pipeline::new(routing, client, workers());

		let req = Request::builder().uri("http://example.com/nope").body(empty_body()).unwrap();
		let resp = pipeline.handle(req).await.expect("non-blackholed miss always responds");
		assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn unmatched_route_is_blackholed_when_configured() {
		let routing = RoutingTable::new(Blackhole(true));
		let client = UpstreamClient::new(Duration::from_secs(1)).unwrap();
		let pipeline = Pipeline::new(routing, client, workers());

		let req = Request::builder().uri("http://example.com/nope").body(empty_body()).unwrap();
		assert!(pipeline.handle(req).await.is_none());
	}

	#[tokio::test]
	async fn host_matching_is_case_insensitive_and_ignores_trailing_dot() {
		let routing = RoutingTable::new(Blackhole(false));
		let route = test_route("example.com");
		let mut change = routing.stage();
		change.add(route);
		change.commit();

		let client = UpstreamClient::new(Duration::from_millis(50)).unwrap();
		let pipeline = Pipeline::new(routing, client, workers());
		let req = Request::builder().uri("http://Example.COM./").header(http::header::HOST, "Example.COM.").body(empty_body()).unwrap();
		// Circuit is closed and the backend is unreachable, but a 502 (not 404) proves the host matched.
		let resp = pipeline.handle(req).await.unwrap();
		assert_ne!(resp.status(), StatusCode::NOT_FOUND);
	}

	fn test_route(domain: &str) -> Route {
		Route {
			route_id: "r1".into(),
			domains: vec![domain.into()],
			path_prefix: "/".into(),
			backend_url: "http://127.0.0.1:1".into(),
			priority: 0,
			request_headers: HeaderPolicy::default(),
			response_headers: HeaderPolicy::default(),
			options: RouteOptions::default(),
			owner_session: None,
			insertion_order: 0,
			backend_state: Arc::new(BackendState::new(CircuitBreakerThresholds::default())),
		}
	}

	#[tokio::test]
	async fn circuit_open_short_circuits_before_dispatch() {
		let routing = RoutingTable::new(Blackhole(false));
		let route = Route {
			backend_state: Arc::new(BackendState::new(CircuitBreakerThresholds { failure_threshold: 1, success_threshold: 1, open_timeout: Duration::from_secs(60) })),
			..test_route("example.com")
		};
		route.backend_state.on_failure();
		let mut change = routing.stage();
		change.add(route);
		change.commit();

		let client = UpstreamClient::new(Duration::from_millis(100)).unwrap();
		let pipeline = Pipeline::new(routing, client, workers());
		let req = Request::builder().uri("http://example.com/").body(empty_body()).unwrap();
		let resp = pipeline.handle(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
	}

	#[tokio::test]
	async fn drain_rejection_carries_retry_after_and_mode_header() {
		let routing = RoutingTable::new(Blackhole(false));
		let route = test_route("example.com");
		route.backend_state.start_drain(Duration::from_secs(60));
		route.backend_state.record_drain_rejection();
		let mut change = routing.stage();
		change.add(route);
		change.commit();

		let client = UpstreamClient::new(Duration::from_millis(100)).unwrap();
		let pipeline = Pipeline::new(routing, client, workers());
		let req = Request::builder().uri("http://example.com/").body(empty_body()).unwrap();
		let resp = pipeline.handle(req).await.unwrap();
		assert_eq!(resp.headers().get("x-drain-mode").unwrap(), "true");
		assert_eq!(resp.headers().get(http::header::RETRY_AFTER).unwrap(), "60");
	}

	#[tokio::test]
	async fn maintenance_without_redirect_carries_retry_after_and_mode_header() {
		let routing = RoutingTable::new(Blackhole(false));
		let route = test_route("example.com");
		route.backend_state.enter_maintenance(None);
		let mut change = routing.stage();
		change.add(route);
		change.commit();

		let client = UpstreamClient::new(Duration::from_millis(100)).unwrap();
		let pipeline = Pipeline::new(routing, client, workers());
		let req = Request::builder().uri("http://example.com/").body(empty_body()).unwrap();
		let resp = pipeline.handle(req).await.unwrap();
		assert_eq!(resp.headers().get("x-maintenance-mode").unwrap(), "true");
		assert_eq!(resp.headers().get(http::header::RETRY_AFTER).unwrap(), "300");
	}

	#[test]
	fn websocket_upgrade_requested_requires_connection_token() {
		let mut headers = http::HeaderMap::new();
		headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
		assert!(websocket_upgrade_requested(&headers).is_none());
		headers.insert(http::header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
		assert_eq!(websocket_upgrade_requested(&headers).unwrap(), "websocket");
	}

	#[test]
	fn request_id_is_preserved_when_already_present() {
		let mut headers = http::HeaderMap::new();
		headers.insert(HeaderName::from_static(X_REQUEST_ID), HeaderValue::from_static("abc-123"));
		assert_eq!(existing_request_id(&headers).as_deref(), Some("abc-123"));
	}
}
