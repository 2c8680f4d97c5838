//! Wires the certificate store, routing table, session manager, worker pool, and the three
//! listeners together, and runs them to completion under one coordinated drain.
//!
//! Grounded on the teacher's `run(config) -> Bound` / `Bound::wait_termination()` shape,
//! stripped of the XDS/CA/MCP wiring that isn't part of this gateway.

use std::sync::Arc;

use gateway_core::drain::{self, DrainTrigger};
use gateway_core::readiness::Ready;
use gateway_core::signal::Shutdown;
use notify_debouncer_full::notify::RecommendedWatcher;
use notify_debouncer_full::{Debouncer, FileIdMap};
use prometheus_client::registry::Registry;
use tokio::task::JoinSet;
use tracing::info;

use crate::certs::CertificateStore;
use crate::client::UpstreamClient;
use crate::config::GatewayConfig;
use crate::health::HealthServer;
use crate::pipeline::Pipeline;
use crate::routing::{Blackhole, RoutingTable};
use crate::session::{SessionManager, SessionManagerConfig};
use crate::workerpool::WorkerPool;

pub struct Bound {
	drain_tx: DrainTrigger,
	shutdown: Shutdown,
	joinset: JoinSet<()>,
	session_manager: Arc<SessionManager>,
	// Held only to keep the filesystem watch alive; dropping it stops certificate reloads.
	_cert_watch: Debouncer<RecommendedWatcher, FileIdMap>,
}

impl Bound {
	pub async fn wait_termination(mut self) -> anyhow::Result<()> {
		self.shutdown.wait().await;
		info!("shutdown signal received, starting drain");
		self.session_manager.broadcast_shutdown();
		self.drain_tx.start_drain_and_wait(drain::DrainMode::Graceful).await;
		while self.joinset.join_next().await.is_some() {}
		Ok(())
	}
}

/// Builds every component and spawns the listeners, handing back a `Bound` whose
/// `wait_termination` blocks until shutdown is requested and the drain completes.
pub async fn run(cfg: GatewayConfig) -> anyhow::Result<Bound> {
	let ready = Ready::new();
	let shutdown = Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();
	let mut joinset = JoinSet::new();

	let cert_dirs: Vec<_> = cfg.cert_dirs.iter().map(|c| (c.dir.clone(), c.domains.clone())).collect();
	let certs = {
		let _block = ready.register_task("load-certificates");
		CertificateStore::load(&cert_dirs)?
	};
	let cert_watch = crate::certs::watch(certs.clone(), cert_dirs)?;

	let routing = RoutingTable::new(Blackhole(cfg.blackhole));
	let workers = WorkerPool::start(cfg.worker_pool, drain_rx.clone(), &mut joinset);
	let session_manager = SessionManager::new(routing.clone(), SessionManagerConfig::default());

	let client = UpstreamClient::new(cfg.upstream_connect_timeout)?;
	let pipeline = Arc::new(Pipeline::new(routing.clone(), client, workers.clone()));

	let registry = Registry::default();
	let health = HealthServer::new(ready.clone(), registry);

	{
		let drain = drain_rx.clone();
		let addr = cfg.health_addr;
		joinset.spawn(async move {
			if let Err(e) = health.serve(addr, drain).await {
				tracing::error!(error = %e, "health server exited");
			}
		});
	}
	{
		let drain = drain_rx.clone();
		let addr = cfg.control_addr;
		let manager = session_manager.clone();
		joinset.spawn(async move {
			if let Err(e) = crate::listener::serve_control_plane(addr, manager, drain).await {
				tracing::error!(error = %e, "control-plane server exited");
			}
		});
	}
	{
		let drain = drain_rx.clone();
		let addr = cfg.https_addr;
		let certs = certs.clone();
		let pipeline = pipeline.clone();
		joinset.spawn(async move {
			if let Err(e) = crate::listener::serve_https(addr, certs, pipeline, drain).await {
				tracing::error!(error = %e, "https listener exited");
			}
		});
	}
	{
		let drain = drain_rx.clone();
		let addr = cfg.http_addr;
		let https_port = cfg.https_addr.port();
		joinset.spawn(async move {
			if let Err(e) = crate::listener::serve_http_redirect(addr, https_port, drain).await {
				tracing::error!(error = %e, "http redirect listener exited");
			}
		});
	}

	Ok(Bound { drain_tx, shutdown, joinset, session_manager, _cert_watch: cert_watch })
}
