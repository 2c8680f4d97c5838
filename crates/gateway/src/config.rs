//! Environment-driven configuration, following the teacher's `parse`/`parse_default`
//! env-var idiom: every knob has a `GATEWAY_*` variable, a sane default, and is parsed
//! once at startup rather than threaded through as individual function arguments.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use gateway_core::prelude::Strng;

use crate::workerpool::{TierConfig, WorkerPoolConfig};

fn parse<T: FromStr>(env_name: &str) -> anyhow::Result<Option<T>>
where
	T::Err: std::error::Error + Send + Sync + 'static,
{
	match env::var(env_name) {
		Ok(val) if !val.is_empty() => Ok(Some(val.parse::<T>()?)),
		_ => Ok(None),
	}
}

fn parse_default<T: FromStr>(env_name: &str, default: T) -> anyhow::Result<T>
where
	T::Err: std::error::Error + Send + Sync + 'static,
{
	Ok(parse(env_name)?.unwrap_or(default))
}

fn parse_duration_default(env_name: &str, default: Duration) -> anyhow::Result<Duration> {
	match env::var(env_name) {
		Ok(val) if !val.is_empty() => Ok(duration_str::parse(&val).map_err(|e| anyhow::anyhow!("invalid duration in {env_name}: {e}"))?),
		_ => Ok(default),
	}
}

fn get_cpu_count() -> usize {
	num_cpus::get()
}

/// Supports plain integers and a `"NN%"` syntax relative to the CPU count, mirroring the
/// original worker-thread sizing knob.
fn parse_worker_threads(env_name: &str, default: usize) -> anyhow::Result<usize> {
	match env::var(env_name) {
		Ok(val) if val.trim().ends_with('%') => {
			let pct: f64 = val.trim().trim_end_matches('%').parse()?;
			let cpus = get_cpu_count() as f64;
			Ok(((pct / 100.0) * cpus).max(1.0) as usize)
		},
		Ok(val) if !val.is_empty() => Ok(val.parse()?),
		_ => Ok(default),
	}
}

fn empty_to_none(s: String) -> Option<String> {
	if s.is_empty() { None } else { Some(s) }
}

#[derive(Debug, Clone)]
pub struct CertDirConfig {
	pub dir: PathBuf,
	pub domains: Vec<Strng>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
	pub http_addr: SocketAddr,
	pub https_addr: SocketAddr,
	pub control_addr: SocketAddr,
	pub health_addr: SocketAddr,
	pub cert_dirs: Vec<CertDirConfig>,
	/// Whether an unmatched request is answered with 404 (false) or dropped (true).
	pub blackhole: bool,
	pub worker_threads: usize,
	pub worker_pool: WorkerPoolConfig,
	pub termination_grace_period: Duration,
	pub upstream_connect_timeout: Duration,
}

impl GatewayConfig {
	pub fn from_env() -> anyhow::Result<Self> {
		let http_addr = parse_default("GATEWAY_HTTP_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?;
		let https_addr = parse_default("GATEWAY_HTTPS_ADDR", SocketAddr::from(([0, 0, 0, 0], 8443)))?;
		let control_addr = parse_default("GATEWAY_CONTROL_ADDR", SocketAddr::from(([127, 0, 0, 1], 9901)))?;
		let health_addr = parse_default("GATEWAY_HEALTH_ADDR", SocketAddr::from(([127, 0, 0, 1], 9902)))?;

		let cert_dirs = env::var("GATEWAY_CERT_DIRS")
			.ok()
			.and_then(empty_to_none)
			.map(parse_cert_dirs)
			.transpose()?
			.unwrap_or_default();

		let blackhole = parse_default("GATEWAY_BLACKHOLE", false)?;
		let worker_threads = parse_worker_threads("GATEWAY_WORKER_THREADS", get_cpu_count())?;
		let termination_grace_period = parse_duration_default("GATEWAY_TERMINATION_GRACE_PERIOD", Duration::from_secs(30))?;
		let upstream_connect_timeout = parse_duration_default("GATEWAY_UPSTREAM_CONNECT_TIMEOUT", Duration::from_secs(5))?;

		let worker_pool = WorkerPoolConfig {
			critical: tier_config_from_env("CRITICAL", TierConfig { min_workers: 1, max_workers: 4, ..TierConfig::default() })?,
			high: tier_config_from_env("HIGH", TierConfig::default())?,
			normal: tier_config_from_env("NORMAL", TierConfig::default())?,
			low: tier_config_from_env("LOW", TierConfig { max_workers: 4, ..TierConfig::default() })?,
			shared_overflow_workers: parse_default("GATEWAY_WORKERPOOL_OVERFLOW", 4)?,
		};

		Ok(Self {
			http_addr,
			https_addr,
			control_addr,
			health_addr,
			cert_dirs,
			blackhole,
			worker_threads,
			worker_pool,
			termination_grace_period,
			upstream_connect_timeout,
		})
	}
}

fn tier_config_from_env(tier: &str, default: TierConfig) -> anyhow::Result<TierConfig> {
	Ok(TierConfig {
		min_workers: parse_default(&format!("GATEWAY_WORKERPOOL_{tier}_MIN"), default.min_workers)?,
		max_workers: parse_default(&format!("GATEWAY_WORKERPOOL_{tier}_MAX"), default.max_workers)?,
		queue_capacity: parse_default(&format!("GATEWAY_WORKERPOOL_{tier}_QUEUE"), default.queue_capacity)?,
		..default
	})
}

/// `GATEWAY_CERT_DIRS` is a `;`-separated list of `dir=domain1,domain2` entries.
fn parse_cert_dirs(raw: String) -> anyhow::Result<Vec<CertDirConfig>> {
	raw
		.split(';')
		.filter(|s| !s.is_empty())
		.map(|entry| {
			let (dir, domains) = entry.split_once('=').ok_or_else(|| anyhow::anyhow!("malformed GATEWAY_CERT_DIRS entry: {entry}"))?;
			Ok(CertDirConfig {
				dir: PathBuf::from(dir),
				domains: domains.split(',').map(Strng::from).collect(),
			})
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_cert_dirs_splits_entries() {
		let parsed = parse_cert_dirs("/etc/certs/a=example.com,*.example.com;/etc/certs/b=other.com".to_string()).unwrap();
		assert_eq!(parsed.len(), 2);
		assert_eq!(parsed[0].dir, PathBuf::from("/etc/certs/a"));
		assert_eq!(parsed[0].domains.len(), 2);
	}

	#[test]
	fn worker_threads_percent_syntax() {
		// SAFETY: single-threaded test process, no concurrent env access.
		unsafe {
			env::set_var("GATEWAY_TEST_PCT", "50%");
		}
		let threads = parse_worker_threads("GATEWAY_TEST_PCT", 1).unwrap();
		assert!(threads >= 1);
		unsafe {
			env::remove_var("GATEWAY_TEST_PCT");
		}
	}
}
