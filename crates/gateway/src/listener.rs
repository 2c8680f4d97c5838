//! Listener Supervisor: binds the plaintext-HTTP, HTTPS, and control-plane ports and keeps
//! them alive until a coordinated drain completes.
//!
//! Grounded on the teacher's `hyper_helpers::Server` bind/spawn-per-listener/drain pattern,
//! inlined here since that helper lived in `management/`, which depended on crates this
//! gateway doesn't carry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gateway_core::drain::{self, DrainWatcher};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::certs::CertificateStore;
use crate::http::{Body, empty_body, full_body};
use crate::pipeline::Pipeline;
use crate::transport::stream::Socket;
use crate::transport::tls;

/// Plaintext port: redirects everything to HTTPS except the ACME HTTP-01 challenge path,
/// which must be served unencrypted.
pub async fn serve_http_redirect(addr: SocketAddr, https_port: u16, drain: DrainWatcher) -> anyhow::Result<()> {
	let listener = TcpListener::bind(addr).await?;
	info!(%addr, "http redirect listener started");
	drain::run_with_drain("http-redirect".to_string(), drain, Duration::from_secs(1), async move |sub_drain, mut force_shutdown| {
		loop {
			tokio::select! {
				biased;
				_ = force_shutdown.changed() => break,
				accepted = listener.accept() => {
					let Ok((stream, _)) = accepted else { continue };
					let conn_drain = sub_drain.clone();
					tokio::spawn(async move {
						let io = TokioIo::new(stream);
						let svc = service_fn(move |req: http::Request<hyper::body::Incoming>| async move { Ok::<_, std::convert::Infallible>(redirect_response(&req, https_port)) });
						if let Err(e) = AutoBuilder::new(TokioExecutor::new()).serve_connection(io, svc).await {
							warn!(error = %e, "http redirect connection error");
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

fn redirect_response(req: &http::Request<hyper::body::Incoming>, https_port: u16) -> http::Response<Body> {
	if req.uri().path().starts_with("/.well-known/acme-challenge/") {
		return http::Response::builder().status(http::StatusCode::NOT_FOUND).body(empty_body()).unwrap();
	}
	let host = req.headers().get(http::header::HOST).and_then(|h| h.to_str().ok()).unwrap_or("");
	let host_only = host.split(':').next().unwrap_or(host);
	let location = if https_port == 443 {
		format!("https://{host_only}{}", req.uri())
	} else {
		format!("https://{host_only}:{https_port}{}", req.uri())
	};
	http::Response::builder()
		.status(http::StatusCode::MOVED_PERMANENTLY)
		.header(http::header::LOCATION, location)
		.body(full_body(Bytes::new()))
		.unwrap()
}

/// HTTPS listener: TLS-terminates via `certs`, then hands the decrypted connection to the
/// Request Pipeline. HTTP/3 (QUIC) is out of scope: no QUIC crate (`quinn`/`h3`) is available
/// in this workspace's dependency set, so only HTTP/1.1 and HTTP/2 over TCP are served.
pub async fn serve_https(addr: SocketAddr, certs: Arc<CertificateStore>, pipeline: Arc<Pipeline>, drain: DrainWatcher) -> anyhow::Result<()> {
	let listener = TcpListener::bind(addr).await?;
	info!(%addr, "https listener started");

	let mut server_cfg = ServerConfig::builder_with_provider(tls::provider())
		.with_protocol_versions(tls::ALL_TLS_VERSIONS)?
		.with_no_client_auth()
		.with_cert_resolver(certs);
	server_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	let server_cfg = Arc::new(server_cfg);

	drain::run_with_drain("https-listener".to_string(), drain, Duration::from_secs(5), async move |sub_drain, mut force_shutdown| {
		loop {
			tokio::select! {
				biased;
				_ = force_shutdown.changed() => break,
				accepted = listener.accept() => {
					let Ok((stream, peer_addr)) = accepted else { continue };
					let cfg = server_cfg.clone();
					let pipeline = pipeline.clone();
					let conn_drain = sub_drain.clone();
					tokio::spawn(async move {
						let socket = match Socket::from_tcp(stream) {
							Ok(s) => s,
							Err(e) => {
								warn!(error = %e, "failed to wrap accepted tcp stream");
								return;
							},
						};
						let tls_socket = match tls::accept(socket, cfg).await {
							Ok(s) => s,
							Err(e) => {
								warn!(error = %e, "tls handshake failed");
								return;
							},
						};
						let io = TokioIo::new(tls_socket);
						let svc = service_fn(move |req: http::Request<hyper::body::Incoming>| {
							let pipeline = pipeline.clone();
							async move {
								let mut req = req.map(crate::http::boxed);
								req.extensions_mut().insert(crate::pipeline::ClientAddr(peer_addr));
								match pipeline.handle(req).await {
									Some(resp) => Ok(resp),
									None => Err(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "route table configured to blackhole unmatched traffic")),
								}
							}
						});
						if let Err(e) = AutoBuilder::new(TokioExecutor::new()).serve_connection(io, svc).await {
							warn!(error = %e, "https connection error");
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

/// Runs the control-plane session server under the same drain coordination as the data-plane
/// listeners, so operators lose their session cleanly rather than mid-command.
pub async fn serve_control_plane(addr: SocketAddr, manager: Arc<crate::session::SessionManager>, drain: DrainWatcher) -> anyhow::Result<()> {
	let listener = TcpListener::bind(addr).await?;
	info!(%addr, "control-plane listener started");
	crate::session::serve(manager, listener, drain).await;
	Ok(())
}
