//! Consolidated health/readiness/metrics server, merging the teacher's
//! `management::readiness_server` and `management::metrics_server` into one listener since
//! this gateway doesn't split admin surfaces across multiple ports.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use gateway_core::drain::{self, DrainWatcher};
use gateway_core::readiness::Ready;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::http::{Body, empty_body, full_body};

#[derive(Clone)]
pub struct HealthServer {
	ready: Ready,
	registry: Arc<Mutex<Registry>>,
}

impl HealthServer {
	pub fn new(ready: Ready, registry: Registry) -> Self {
		Self { ready, registry: Arc::new(Mutex::new(registry)) }
	}

	pub async fn serve(self, addr: SocketAddr, drain: DrainWatcher) -> anyhow::Result<()> {
		let listener = TcpListener::bind(addr).await?;
		info!(%addr, "health/metrics server listening");
		drain::run_with_drain("health-server".to_string(), drain, std::time::Duration::from_secs(2), async move |sub_drain, mut force_shutdown| {
			loop {
				tokio::select! {
					biased;
					_ = force_shutdown.changed() => break,
					accepted = listener.accept() => {
						let Ok((stream, _peer)) = accepted else { continue };
						let this = self.clone();
						let conn_drain = sub_drain.clone();
						tokio::spawn(async move {
							let io = TokioIo::new(stream);
							let svc = service_fn(move |req| {
								let this = this.clone();
								async move { this.handle(req).await }
							});
							if let Err(e) = AutoBuilder::new(TokioExecutor::new()).serve_connection(io, svc).await {
								warn!(error = %e, "health connection error");
							}
							drop(conn_drain);
						});
					}
				}
			}
		})
		.await;
		Ok(())
	}

	async fn handle(&self, req: http::Request<Incoming>) -> Result<http::Response<Body>, std::convert::Infallible> {
		let path = req.uri().path();
		let resp = match path {
			"/healthz/ready" | "/ready" => self.ready_response(),
			"/metrics" | "/stats/prometheus" => self.metrics_response(req.headers().get(http::header::ACCEPT)),
			"/healthz" | "/health" => http::Response::builder().status(http::StatusCode::OK).body(full_body(Bytes::from_static(b"ok\n"))).unwrap(),
			_ => http::Response::builder().status(http::StatusCode::NOT_FOUND).body(empty_body()).unwrap(),
		};
		Ok(resp)
	}

	fn ready_response(&self) -> http::Response<Body> {
		let pending = self.ready.pending();
		if pending.is_empty() {
			http::Response::builder().status(http::StatusCode::OK).body(full_body(Bytes::from_static(b"ready\n"))).unwrap()
		} else {
			let body = format!("not ready, pending: {}\n", pending.into_iter().collect::<Vec<_>>().join(", "));
			http::Response::builder().status(http::StatusCode::INTERNAL_SERVER_ERROR).body(full_body(Bytes::from(body))).unwrap()
		}
	}

	fn metrics_response(&self, accept: Option<&http::HeaderValue>) -> http::Response<Body> {
		let openmetrics = accept.and_then(|v| v.to_str().ok()).is_some_and(|v| v.contains("application/openmetrics-text"));
		let mut buf = String::new();
		if encode(&mut buf, &self.registry.lock()).is_err() {
			return http::Response::builder().status(http::StatusCode::INTERNAL_SERVER_ERROR).body(empty_body()).unwrap();
		}
		let content_type = if openmetrics { "application/openmetrics-text; version=1.0.0; charset=utf-8" } else { "text/plain; version=0.0.4; charset=utf-8" };
		http::Response::builder().status(http::StatusCode::OK).header(http::header::CONTENT_TYPE, content_type).body(full_body(Bytes::from(buf))).unwrap()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn ready_response_reports_pending_tasks() {
		let ready = Ready::new();
		let _block = ready.register_task("warmup");
		let server = HealthServer::new(ready, Registry::default());
		let resp = server.ready_response();
		assert_eq!(resp.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
	}

	#[tokio::test]
	async fn ready_response_ok_once_unblocked() {
		let ready = Ready::new();
		{
			let _block = ready.register_task("warmup");
		}
		let server = HealthServer::new(ready, Registry::default());
		let resp = server.ready_response();
		assert_eq!(resp.status(), http::StatusCode::OK);
	}

	#[tokio::test]
	async fn metrics_response_encodes_registry() {
		let server = HealthServer::new(Ready::new(), Registry::default());
		let resp = server.metrics_response(None);
		assert_eq!(resp.status(), http::StatusCode::OK);
	}
}
