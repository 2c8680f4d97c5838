//! TLS certificate store: wildcard-aware SNI resolution over an atomically swappable
//! snapshot, hot-reloaded from a directory of PEM files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use gateway_core::prelude::Strng;
use notify_debouncer_full::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, FileIdMap, new_debouncer};
use rustls::crypto::ring::sign;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::types::CertificateEntry;

#[derive(Debug, thiserror::Error)]
pub enum CertError {
	#[error("no certificates found in {0}")]
	Empty(PathBuf),
	#[error("failed to read {path}: {source}")]
	Read { path: PathBuf, source: std::io::Error },
	#[error("no private key found in {0}")]
	NoKey(PathBuf),
	#[error("invalid key material in {path}: {source}")]
	InvalidKey { path: PathBuf, source: rustls::Error },
}

/// One certificate directory is expected to contain `fullchain.pem` and `privkey.pem`; the
/// domains it covers are taken from the leaf certificate's SANs, falling back to a
/// directory-supplied override so tests don't need real x509 SAN parsing.
pub fn load_entry(dir: &Path, domains: Vec<Strng>) -> Result<CertificateEntry, CertError> {
	let cert_path = dir.join("fullchain.pem");
	let key_path = dir.join("privkey.pem");

	let cert_bytes = std::fs::read(&cert_path).map_err(|source| CertError::Read {
		path: cert_path.clone(),
		source,
	})?;
	let key_bytes = std::fs::read(&key_path).map_err(|source| CertError::Read {
		path: key_path.clone(),
		source,
	})?;

	let certs: Vec<_> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
		.collect::<Result<_, _>>()
		.map_err(|source| CertError::Read { path: cert_path.clone(), source })?;
	if certs.is_empty() {
		return Err(CertError::Empty(cert_path));
	}

	let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
		.map_err(|source| CertError::Read { path: key_path.clone(), source })?
		.ok_or_else(|| CertError::NoKey(key_path.clone()))?;

	let signing_key = sign::any_supported_type(&key).map_err(|source| CertError::InvalidKey {
		path: key_path.clone(),
		source,
	})?;

	Ok(CertificateEntry {
		domains,
		key: Arc::new(CertifiedKey::new(certs, signing_key)),
		source_files: vec![cert_path, key_path],
		loaded_at: Instant::now(),
	})
}

/// Current set of loaded certificates, swapped in wholesale on reload.
struct Snapshot {
	entries: Vec<CertificateEntry>,
}

pub struct CertificateStore {
	snapshot: ArcSwap<Snapshot>,
	reload_count: std::sync::atomic::AtomicU64,
	failed_reload_count: std::sync::atomic::AtomicU64,
}

impl CertificateStore {
	/// Fails fast if no certificates load: an edge proxy with zero usable certs cannot serve
	/// TLS traffic at all.
	pub fn load(dirs: &[(PathBuf, Vec<Strng>)]) -> Result<Arc<CertificateStore>, CertError> {
		let mut entries = Vec::new();
		for (dir, domains) in dirs {
			match load_entry(dir, domains.clone()) {
				Ok(entry) => entries.push(entry),
				Err(e) => error!(dir = %dir.display(), error = %e, "failed to load certificate"),
			}
		}
		if entries.is_empty() {
			return Err(CertError::Empty(PathBuf::from("<all configured dirs>")));
		}
		Ok(Arc::new(CertificateStore {
			snapshot: ArcSwap::new(Arc::new(Snapshot { entries })),
			reload_count: Default::default(),
			failed_reload_count: Default::default(),
		}))
	}

	/// Wildcard-aware lookup: exact match first, then single-label wildcard suffix, then
	/// whatever entry is marked as the fallback (first loaded), else none.
	pub fn resolve(&self, sni: Option<&str>) -> Option<Arc<CertifiedKey>> {
		let snapshot = self.snapshot.load();
		let Some(name) = sni else {
			return snapshot.entries.first().map(|e| e.key.clone());
		};
		let name = crate::types::normalize_host(name);
		if let Some(entry) = snapshot.entries.iter().find(|e| e.domains.iter().any(|d| crate::types::normalize_host(d) == name)) {
			return Some(entry.key.clone());
		}
		if let Some(entry) = snapshot
			.entries
			.iter()
			.find(|e| e.domains.iter().any(|d| crate::types::domain_matches(d, &name)))
		{
			return Some(entry.key.clone());
		}
		snapshot.entries.first().map(|e| e.key.clone())
	}

	fn reload(&self, dirs: &[(PathBuf, Vec<Strng>)]) {
		let mut entries = Vec::new();
		let mut failed = false;
		for (dir, domains) in dirs {
			match load_entry(dir, domains.clone()) {
				Ok(entry) => entries.push(entry),
				Err(e) => {
					failed = true;
					error!(dir = %dir.display(), error = %e, "certificate reload failed, keeping previous snapshot for this entry");
				},
			}
		}
		if entries.is_empty() {
			self.failed_reload_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
			warn!("certificate reload produced zero usable entries, keeping previous snapshot");
			return;
		}
		self.snapshot.store(Arc::new(Snapshot { entries }));
		if failed {
			self.failed_reload_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		} else {
			self.reload_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		}
		info!("certificate snapshot reloaded");
	}

	pub fn reload_counts(&self) -> (u64, u64) {
		(
			self.reload_count.load(std::sync::atomic::Ordering::Relaxed),
			self.failed_reload_count.load(std::sync::atomic::Ordering::Relaxed),
		)
	}
}

impl std::fmt::Debug for CertificateStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertificateStore").finish()
	}
}

impl ResolvesServerCert for CertificateStore {
	fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
		self.resolve(client_hello.server_name())
	}
}

/// Watches every certificate directory for changes and reloads the snapshot on debounce.
/// Returns a debouncer guard that must be held for the watch to stay alive.
pub fn watch(
	store: Arc<CertificateStore>,
	dirs: Vec<(PathBuf, Vec<Strng>)>,
) -> anyhow::Result<Debouncer<RecommendedWatcher, FileIdMap>> {
	let watch_dirs = dirs.clone();
	let mut debouncer = new_debouncer(
		Duration::from_secs(2),
		None,
		move |result: DebounceEventResult| match result {
			Ok(_events) => store.reload(&watch_dirs),
			Err(errors) => {
				for e in errors {
					warn!(error = %e, "certificate watch error");
				}
			},
		},
	)?;
	for (dir, _) in &dirs {
		debouncer.watch(dir, RecursiveMode::NonRecursive)?;
	}
	Ok(debouncer)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn write_self_signed(dir: &Path) {
		let cert = rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
		std::fs::write(dir.join("fullchain.pem"), cert.cert.pem()).unwrap();
		std::fs::write(dir.join("privkey.pem"), cert.signing_key.serialize_pem()).unwrap();
	}

	#[test]
	fn loads_and_resolves_exact_match() {
		let tmp = tempfile::tempdir().unwrap();
		write_self_signed(tmp.path());
		let store = CertificateStore::load(&[(tmp.path().to_path_buf(), vec!["example.com".into()])]).unwrap();
		assert!(store.resolve(Some("example.com")).is_some());
	}

	#[test]
	fn wildcard_resolution_precedence() {
		let tmp = tempfile::tempdir().unwrap();
		write_self_signed(tmp.path());
		let store = CertificateStore::load(&[(tmp.path().to_path_buf(), vec!["*.example.com".into()])]).unwrap();
		assert!(store.resolve(Some("api.example.com")).is_some());
		assert!(store.resolve(Some("example.com")).is_some(), "falls back to the only loaded entry");
	}

	#[test]
	fn resolution_is_case_insensitive_and_ignores_trailing_dot() {
		let tmp = tempfile::tempdir().unwrap();
		write_self_signed(tmp.path());
		let store = CertificateStore::load(&[(tmp.path().to_path_buf(), vec!["example.com".into()])]).unwrap();
		assert!(store.resolve(Some("Example.COM.")).is_some());
	}

	#[test]
	fn empty_directory_set_is_fatal() {
		let tmp = tempfile::tempdir().unwrap();
		let result = CertificateStore::load(&[(tmp.path().to_path_buf(), vec!["example.com".into()])]);
		assert!(result.is_err());
	}
}
