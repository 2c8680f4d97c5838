//! Upstream dispatch client: DNS resolution plus a pooled HTTP/1.1+HTTP/2 connector used to
//! forward proxied requests to backends.
//!
//! Grounded on the teacher's `client/` connector (hickory-resolver for DNS, a hyper-util
//! legacy `Client` for pooling) trimmed of HBONE/mTLS tunneling, which is out of scope here.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use http::Uri;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::dns::Name;
use hyper_util::client::legacy::connect::{HttpConnector, HttpInfo};
use hyper_util::rt::TokioExecutor;
use tower::Service;

use crate::http::{Body, Error};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("upstream request failed: {0}")]
	Request(#[from] hyper_util::client::legacy::Error),
	#[error("invalid upstream uri: {0}")]
	Uri(#[from] http::uri::InvalidUri),
	#[error("backend url {0} has no authority")]
	MissingAuthority(String),
	#[error("invalid rewritten uri for backend {0}")]
	InvalidRewrite(String),
}

/// A `tower::Service<Name> -> SocketAddr` resolver backed by hickory-resolver, used in place
/// of the connector's default std-lib blocking resolver so DNS lookups don't stall a worker
/// thread.
#[derive(Clone)]
pub struct HickoryResolver {
	resolver: Arc<TokioAsyncResolver>,
}

impl HickoryResolver {
	pub fn from_system() -> anyhow::Result<Self> {
		let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
		Ok(Self { resolver: Arc::new(resolver) })
	}
}

impl Service<Name> for HickoryResolver {
	type Response = std::vec::IntoIter<SocketAddr>;
	type Error = hickory_resolver::error::ResolveError;
	type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
		std::task::Poll::Ready(Ok(()))
	}

	fn call(&mut self, name: Name) -> Self::Future {
		let resolver = self.resolver.clone();
		Box::pin(async move {
			let lookup = resolver.lookup_ip(name.as_str()).await?;
			let addrs: Vec<SocketAddr> = lookup.into_iter().map(|ip: IpAddr| SocketAddr::new(ip, 0)).collect();
			Ok(addrs.into_iter())
		})
	}
}

#[derive(Clone)]
pub struct UpstreamClient {
	inner: Client<HttpConnector<HickoryResolver>, Body>,
}

impl UpstreamClient {
	pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
		let resolver = HickoryResolver::from_system()?;
		let mut connector = HttpConnector::new_with_resolver(resolver);
		connector.set_connect_timeout(Some(connect_timeout));
		connector.set_nodelay(true);
		connector.enforce_http(false);
		let inner = Client::builder(TokioExecutor::new()).pool_idle_timeout(Duration::from_secs(90)).build(connector);
		Ok(Self { inner })
	}

	pub async fn request(&self, req: http::Request<Body>) -> Result<http::Response<Body>, ClientError> {
		let resp = self.inner.request(req).await?;
		Ok(resp.map(crate::http::boxed))
	}
}

/// Peer address the upstream connection was actually made to, stashed in the response
/// extensions by hyper-util's `HttpInfo`; used for access logging.
pub fn peer_addr(resp: &http::Response<Body>) -> Option<SocketAddr> {
	resp.extensions().get::<HttpInfo>().map(|info| info.remote_addr())
}

/// Builds the request `Uri` that should be sent upstream: `backend_url` as scheme+authority,
/// original path+query preserved, `path_prefix` stripped if `strip_prefix` requested it.
pub fn rewrite_uri(backend_url: &str, original: &Uri, strip_prefix: Option<&str>) -> Result<Uri, ClientError> {
	let backend: Uri = backend_url.parse()?;
	let path_and_query = original.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
	let rewritten_path = match strip_prefix {
		Some(prefix) if !prefix.is_empty() && prefix != "/" => {
			let stripped = path_and_query.strip_prefix(prefix).unwrap_or(path_and_query);
			if stripped.is_empty() { "/".to_string() } else if stripped.starts_with('/') { stripped.to_string() } else { format!("/{stripped}") }
		},
		_ => path_and_query.to_string(),
	};
	let authority = backend
		.authority()
		.cloned()
		.ok_or_else(|| ClientError::MissingAuthority(backend_url.to_string()))?;
	Uri::builder()
		.scheme(backend.scheme().cloned().unwrap_or(http::uri::Scheme::HTTP))
		.authority(authority)
		.path_and_query(rewritten_path)
		.build()
		.map_err(|_| ClientError::InvalidRewrite(backend_url.to_string()))
}

pub fn empty_body() -> Bytes {
	Bytes::new()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rewrite_uri_preserves_path_without_prefix() {
		let original: Uri = "http://edge.example/api/v1/widgets?x=1".parse().unwrap();
		let rewritten = rewrite_uri("http://backend.internal:9000", &original, None).unwrap();
		assert_eq!(rewritten.to_string(), "http://backend.internal:9000/api/v1/widgets?x=1");
	}

	#[test]
	fn rewrite_uri_strips_configured_prefix() {
		let original: Uri = "http://edge.example/api/v1/widgets".parse().unwrap();
		let rewritten = rewrite_uri("http://backend.internal:9000", &original, Some("/api/v1")).unwrap();
		assert_eq!(rewritten.to_string(), "http://backend.internal:9000/widgets");
	}

	#[test]
	fn rewrite_uri_strip_to_empty_becomes_root() {
		let original: Uri = "http://edge.example/api".parse().unwrap();
		let rewritten = rewrite_uri("http://backend.internal", &original, Some("/api")).unwrap();
		assert_eq!(rewritten.to_string(), "http://backend.internal/");
	}
}
