// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::env;
use std::str::FromStr;
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, Registry, filter, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

/// Installs the global subscriber and returns a guard that must be held for the
/// lifetime of the process; dropping it flushes the non-blocking writer.
pub fn setup_logging() -> tracing_appender::non_blocking::WorkerGuard {
	Lazy::force(&APPLICATION_START_TIME);
	let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());
	let format = tracing_subscriber::fmt::layer()
		.with_writer(non_blocking)
		.with_target(true);
	let filter = default_filter();
	let (layer, reload) = reload::Layer::new(format.with_filter(filter));
	LOG_HANDLE
		.set(reload)
		.map_or_else(|_| warn!("setup log handler failed"), |_| {});
	tracing_subscriber::registry().with(layer).init();
	guard
}

fn default_filter() -> filter::Targets {
	let var = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
	filter::Targets::from_str(&var).expect("static filter should build")
}

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, filter::Targets, Registry>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

/// Dynamically updates the logging level to *include* `level`. If `reset` is true, the
/// filter is rebuilt from the default first.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
	let Some(handle) = LOG_HANDLE.get() else {
		warn!("failed to get log handle");
		return Err(Error::Uninitialized);
	};
	let current = handle.with_current(|f| f.filter().to_string())?;
	let new_directive = if reset {
		if level.is_empty() {
			default_filter().to_string()
		} else {
			format!("{},{}", default_filter(), level)
		}
	} else {
		format!("{current},{level}")
	};
	let new_filter = filter::Targets::from_str(&new_directive)?;
	Ok(handle.modify(|layer| {
		*layer.filter_mut() = new_filter;
	})?)
}

pub fn get_current_loglevel() -> Result<String, Error> {
	let handle = LOG_HANDLE.get().ok_or(Error::Uninitialized)?;
	Ok(handle.with_current(|f| f.filter().to_string())?)
}

#[derive(Error, Debug)]
pub enum Error {
	#[error("parse failure: {0}")]
	InvalidFilter(#[from] filter::ParseError),
	#[error("reload failure: {0}")]
	Reload(#[from] reload::Error),
	#[error("logging is not initialized")]
	Uninitialized,
}
