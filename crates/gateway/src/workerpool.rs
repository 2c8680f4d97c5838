//! Tiered worker-pool scheduler for off-request-path work (access logging, metrics
//! submission, health checks). Each tier scales its worker count between a configured
//! min/max range driven by queue-depth hysteresis; a shared overflow pool picks up anything
//! a saturated tier can't absorb.
//!
//! Grounded on app.rs's `new_data_plane_pool` (dedicated runtime + `JoinSet` + `mpsc`
//! channel) pattern, generalized to four tiers plus hysteresis-driven scaling, per-task
//! timeouts, retry-with-backoff, and a dead-letter list for tasks that exhaust retries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use gateway_core::drain::{self, DrainWatcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A unit of off-path work. `Fn` rather than `FnOnce` so a panicked attempt can be retried
/// without re-queuing: the closure only ever borrows its captures.
pub type Task = Arc<dyn Fn() + Send + Sync + 'static>;

const SCALE_CHECK_INTERVAL: Duration = Duration::from_millis(250);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_TASK_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
	Critical,
	High,
	Normal,
	Low,
}

impl Tier {
	pub const ALL: [Tier; 4] = [Tier::Critical, Tier::High, Tier::Normal, Tier::Low];

	fn label(self) -> &'static str {
		match self {
			Tier::Critical => "critical",
			Tier::High => "high",
			Tier::Normal => "normal",
			Tier::Low => "low",
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct TierConfig {
	pub min_workers: usize,
	pub max_workers: usize,
	/// Queue depth / worker-count ratio above which another worker is spun up.
	pub scale_up_ratio: f64,
	/// Ratio below which an idle worker is allowed to exit, down to `min_workers`.
	pub scale_down_ratio: f64,
	pub queue_capacity: usize,
	pub task_timeout: Duration,
	pub task_grace_period: Duration,
}

impl Default for TierConfig {
	fn default() -> Self {
		Self {
			min_workers: 1,
			max_workers: 8,
			scale_up_ratio: 4.0,
			scale_down_ratio: 0.5,
			queue_capacity: 1024,
			task_timeout: Duration::from_secs(10),
			task_grace_period: Duration::from_secs(2),
		}
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerPoolConfig {
	pub critical: TierConfig,
	pub high: TierConfig,
	pub normal: TierConfig,
	pub low: TierConfig,
	pub shared_overflow_workers: usize,
}

impl WorkerPoolConfig {
	fn tier(&self, tier: Tier) -> TierConfig {
		match tier {
			Tier::Critical => self.critical,
			Tier::High => self.high,
			Tier::Normal => self.normal,
			Tier::Low => self.low,
		}
	}
}

struct TierHandle {
	tx: mpsc::Sender<Task>,
	in_flight: Arc<AtomicUsize>,
	processed: Arc<AtomicUsize>,
	failed: Arc<AtomicUsize>,
	active_workers: Arc<AtomicUsize>,
}

/// An in-flight registry entry, used to detect and sweep tasks whose async bookkeeping never
/// completed (the task's own future was dropped or panicked outside the per-task catch_unwind,
/// e.g. during a runtime-wide stall), so they don't linger forever counted as running.
struct InFlight {
	id: u64,
	tier: Tier,
	started: Instant,
	deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
	pub tier: Tier,
	pub attempts: u32,
	pub reason: &'static str,
}

pub struct WorkerPool {
	tiers: HashMap<Tier, TierHandle>,
	overflow_tx: mpsc::Sender<Task>,
	in_flight_registry: Arc<parking_lot::Mutex<Vec<InFlight>>>,
	dead_letter: Arc<parking_lot::Mutex<Vec<DeadLetterEntry>>>,
}

pub struct WorkerPoolStats {
	pub tier: Tier,
	pub active_workers: usize,
	pub in_flight: usize,
	pub processed: usize,
	pub failed: usize,
}

impl WorkerPool {
	/// Spawns the tiered worker tasks plus the shared overflow pool onto `joinset`.
	/// `drain` keeps the pool alive until shutdown is signalled, then lets in-flight tasks
	/// finish before workers exit.
	pub fn start(cfg: WorkerPoolConfig, drain: DrainWatcher, joinset: &mut JoinSet<()>) -> Arc<WorkerPool> {
		let in_flight_registry = Arc::new(parking_lot::Mutex::new(Vec::new()));
		let dead_letter = Arc::new(parking_lot::Mutex::new(Vec::new()));
		let mut tiers = HashMap::new();

		for &tier in &Tier::ALL {
			let tier_cfg = cfg.tier(tier);
			let (tx, rx) = mpsc::channel::<Task>(tier_cfg.queue_capacity);
			let in_flight = Arc::new(AtomicUsize::new(0));
			let processed = Arc::new(AtomicUsize::new(0));
			let failed = Arc::new(AtomicUsize::new(0));
			let active_workers = Arc::new(AtomicUsize::new(0));
			spawn_tier(
				tier,
				tier_cfg,
				tx.clone(),
				rx,
				in_flight.clone(),
				processed.clone(),
				failed.clone(),
				active_workers.clone(),
				in_flight_registry.clone(),
				dead_letter.clone(),
				drain.clone(),
				joinset,
			);
			tiers.insert(tier, TierHandle { tx, in_flight, processed, failed, active_workers });
		}

		let (overflow_tx, overflow_rx) = mpsc::channel::<Task>(4096);
		spawn_overflow(cfg.shared_overflow_workers.max(1), overflow_rx, drain.clone(), joinset);
		spawn_sweeper(in_flight_registry.clone(), dead_letter.clone(), drain, joinset);

		Arc::new(WorkerPool { tiers, overflow_tx, in_flight_registry, dead_letter })
	}

	/// Submits work to `tier`'s queue; if the queue is full, falls back to the shared
	/// overflow pool rather than blocking the caller (the request/response hot path).
	pub fn submit(&self, tier: Tier, task: Task) {
		let Some(handle) = self.tiers.get(&tier) else {
			return;
		};
		match handle.tx.try_send(task) {
			Ok(()) => {},
			Err(mpsc::error::TrySendError::Full(task)) => {
				debug!(tier = tier.label(), "tier queue full, routing to overflow pool");
				if self.overflow_tx.try_send(task).is_err() {
					warn!(tier = tier.label(), "overflow pool also full, dropping task");
					handle.failed.fetch_add(1, Ordering::Relaxed);
				}
			},
			Err(mpsc::error::TrySendError::Closed(_)) => {
				warn!(tier = tier.label(), "tier is shut down, dropping task");
			},
		}
	}

	pub fn stats(&self) -> Vec<WorkerPoolStats> {
		Tier::ALL
			.iter()
			.filter_map(|t| {
				self.tiers.get(t).map(|h| WorkerPoolStats {
					tier: *t,
					active_workers: h.active_workers.load(Ordering::Relaxed),
					in_flight: h.in_flight.load(Ordering::Relaxed),
					processed: h.processed.load(Ordering::Relaxed),
					failed: h.failed.load(Ordering::Relaxed),
				})
			})
			.collect()
	}

	pub fn dead_letter_count(&self) -> usize {
		self.dead_letter.lock().len()
	}

	/// Sweeps the in-flight registry for entries whose deadline has elapsed without being
	/// cleared by `run_task`'s own bookkeeping, i.e. the task's future was dropped or
	/// panicked somewhere that skipped normal cleanup. Called periodically by a background
	/// task spawned in `start`; exposed for tests and for an operator-triggered sweep.
	pub fn sweep_crashed(&self) -> usize {
		let mut registry = self.in_flight_registry.lock();
		let before = registry.len();
		let mut swept = Vec::new();
		registry.retain(|entry| {
			let stale = entry.started.elapsed() >= entry.deadline;
			if stale {
				swept.push(entry.tier);
			}
			!stale
		});
		let removed = before - registry.len();
		drop(registry);
		if removed > 0 {
			let mut dead_letter = self.dead_letter.lock();
			for tier in swept {
				dead_letter.push(DeadLetterEntry { tier, attempts: MAX_TASK_ATTEMPTS, reason: "crash-recovery sweep: task never completed" });
			}
		}
		removed
	}
}

#[allow(clippy::too_many_arguments)]
fn spawn_tier(
	tier: Tier,
	cfg: TierConfig,
	tx: mpsc::Sender<Task>,
	rx: mpsc::Receiver<Task>,
	in_flight: Arc<AtomicUsize>,
	processed: Arc<AtomicUsize>,
	failed: Arc<AtomicUsize>,
	active_workers: Arc<AtomicUsize>,
	registry: Arc<parking_lot::Mutex<Vec<InFlight>>>,
	dead_letter: Arc<parking_lot::Mutex<Vec<DeadLetterEntry>>>,
	drain: DrainWatcher,
	joinset: &mut JoinSet<()>,
) {
	let rx = Arc::new(tokio::sync::Mutex::new(rx));
	let retire_budget = Arc::new(AtomicUsize::new(0));
	let next_id = Arc::new(AtomicUsize::new(0));

	for _ in 0..cfg.min_workers {
		let rx = rx.clone();
		let in_flight = in_flight.clone();
		let processed = processed.clone();
		let failed = failed.clone();
		let active_workers = active_workers.clone();
		let registry = registry.clone();
		let dead_letter = dead_letter.clone();
		let retire_budget = retire_budget.clone();
		let next_id = next_id.clone();
		let drain = drain.clone();
		joinset.spawn(async move {
			info!(tier = tier.label(), min = cfg.min_workers, max = cfg.max_workers, "worker tier started");
			drain::run_with_drain(format!("worker-pool-{}", tier.label()), drain, cfg.task_grace_period, async move |_sub_drain, force_shutdown| {
				worker_loop(tier, cfg, rx, in_flight, processed, failed, active_workers, registry, dead_letter, retire_budget, next_id, force_shutdown).await;
			})
			.await;
		});
	}

	// Scaling supervisor: adjusts worker count between min_workers and max_workers based on
	// queue-depth hysteresis. Scale-up spawns are tracked locally and joined before the
	// supervisor (itself joinset-tracked) reports itself finished, so drain still waits for them.
	joinset.spawn(async move {
		drain::run_with_drain(format!("worker-pool-{}-scaler", tier.label()), drain, Duration::from_millis(10), async move |_sub_drain, force_shutdown| {
			let mut scaled_up: Vec<tokio::task::JoinHandle<()>> = Vec::new();
			let mut ticker = tokio::time::interval(SCALE_CHECK_INTERVAL);
			let mut shutdown = force_shutdown.clone();
			loop {
				tokio::select! {
					biased;
					_ = shutdown.changed() => break,
					_ = ticker.tick() => {
						scaled_up.retain(|h| !h.is_finished());
						let active = active_workers.load(Ordering::Relaxed).max(1);
						let depth = cfg.queue_capacity.saturating_sub(tx.capacity());
						let ratio = depth as f64 / active as f64;
						if ratio > cfg.scale_up_ratio && active < cfg.max_workers {
							debug!(tier = tier.label(), active, depth, ratio, "scaling tier up");
							let rx = rx.clone();
							let in_flight = in_flight.clone();
							let processed = processed.clone();
							let failed = failed.clone();
							let active_workers = active_workers.clone();
							let registry = registry.clone();
							let dead_letter = dead_letter.clone();
							let retire_budget = retire_budget.clone();
							let next_id = next_id.clone();
							let worker_shutdown = force_shutdown.clone();
							scaled_up.push(tokio::spawn(async move {
								worker_loop(tier, cfg, rx, in_flight, processed, failed, active_workers, registry, dead_letter, retire_budget, next_id, worker_shutdown).await;
							}));
						} else if ratio < cfg.scale_down_ratio && active > cfg.min_workers {
							debug!(tier = tier.label(), active, depth, ratio, "scaling tier down");
							retire_budget.fetch_add(1, Ordering::Relaxed);
						}
					}
				}
			}
			for handle in scaled_up {
				let _ = handle.await;
			}
		})
		.await;
	});
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
	tier: Tier,
	cfg: TierConfig,
	rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
	in_flight: Arc<AtomicUsize>,
	processed: Arc<AtomicUsize>,
	failed: Arc<AtomicUsize>,
	active_workers: Arc<AtomicUsize>,
	registry: Arc<parking_lot::Mutex<Vec<InFlight>>>,
	dead_letter: Arc<parking_lot::Mutex<Vec<DeadLetterEntry>>>,
	retire_budget: Arc<AtomicUsize>,
	next_id: Arc<AtomicUsize>,
	mut force_shutdown: watch::Receiver<()>,
) -> impl Future<Output = ()> + Send + 'static {
	active_workers.fetch_add(1, Ordering::Relaxed);
	async move {
		loop {
			if try_retire(&retire_budget, &active_workers, cfg.min_workers) {
				break;
			}

			let task = {
				let mut locked = rx.lock().await;
				tokio::select! {
					biased;
					_ = force_shutdown.changed() => {
						locked.close();
						while let Ok(task) = locked.try_recv() {
							let id = next_id.fetch_add(1, Ordering::Relaxed) as u64;
							run_task(tier, id, &task, cfg, &in_flight, &processed, &failed, &registry, &dead_letter).await;
						}
						break;
					}
					task = locked.recv() => task,
				}
			};
			match task {
				Some(task) => {
					let id = next_id.fetch_add(1, Ordering::Relaxed) as u64;
					run_task(tier, id, &task, cfg, &in_flight, &processed, &failed, &registry, &dead_letter).await;
				},
				None => break,
			}
		}
		active_workers.fetch_sub(1, Ordering::Relaxed);
		info!(tier = tier.label(), "worker exited");
	}
}

/// If a scale-down is pending and we're above `min_workers`, claims one unit of retire budget
/// and reports this worker should exit.
fn try_retire(retire_budget: &AtomicUsize, active_workers: &AtomicUsize, min_workers: usize) -> bool {
	loop {
		let budget = retire_budget.load(Ordering::Relaxed);
		if budget == 0 {
			return false;
		}
		if active_workers.load(Ordering::Relaxed) <= min_workers {
			return false;
		}
		if retire_budget.compare_exchange(budget, budget - 1, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
			return true;
		}
	}
}

fn spawn_overflow(workers: usize, rx: mpsc::Receiver<Task>, drain: DrainWatcher, joinset: &mut JoinSet<()>) {
	let rx = Arc::new(tokio::sync::Mutex::new(rx));
	for worker_id in 0..workers {
		let rx = rx.clone();
		let drain = drain.clone();
		joinset.spawn(async move {
			drain::run_with_drain("worker-pool-overflow".to_string(), drain, Duration::from_secs(2), async move |_sub_drain, mut force_shutdown| {
				loop {
					let task = {
						let mut rx = rx.lock().await;
						tokio::select! {
							biased;
							_ = force_shutdown.changed() => None,
							task = rx.recv() => task,
						}
					};
					match task {
						Some(task) => task(),
						None => break,
					}
				}
				debug!(worker_id, "overflow worker stopped");
			})
			.await;
		});
	}
}

fn spawn_sweeper(registry: Arc<parking_lot::Mutex<Vec<InFlight>>>, dead_letter: Arc<parking_lot::Mutex<Vec<DeadLetterEntry>>>, drain: DrainWatcher, joinset: &mut JoinSet<()>) {
	joinset.spawn(async move {
		drain::run_with_drain("worker-pool-sweeper".to_string(), drain, Duration::from_millis(500), async move |_sub_drain, mut force_shutdown| {
			let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
			loop {
				tokio::select! {
					biased;
					_ = force_shutdown.changed() => break,
					_ = ticker.tick() => {
						let before = registry.lock().len();
						let mut swept = Vec::new();
						registry.lock().retain(|entry| {
							let stale = entry.started.elapsed() >= entry.deadline;
							if stale {
								swept.push((entry.id, entry.tier));
							}
							!stale
						});
						if !swept.is_empty() {
							let mut dead_letter = dead_letter.lock();
							for (id, tier) in &swept {
								warn!(tier = tier.label(), id, "crash recovery: in-flight task exceeded its deadline, moving to dead letter");
								dead_letter.push(DeadLetterEntry { tier: *tier, attempts: MAX_TASK_ATTEMPTS, reason: "crash-recovery sweep: task never completed" });
							}
						}
						debug!(swept = before.saturating_sub(registry.lock().len()), "in-flight sweep complete");
					}
				}
			}
		})
		.await;
	});
}

enum TaskOutcome {
	Success,
	Failed(u32),
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
	tier: Tier,
	id: u64,
	task: &Task,
	cfg: TierConfig,
	in_flight: &Arc<AtomicUsize>,
	processed: &Arc<AtomicUsize>,
	failed: &Arc<AtomicUsize>,
	registry: &Arc<parking_lot::Mutex<Vec<InFlight>>>,
	dead_letter: &Arc<parking_lot::Mutex<Vec<DeadLetterEntry>>>,
) {
	in_flight.fetch_add(1, Ordering::Relaxed);
	registry.lock().push(InFlight { id, tier, started: Instant::now(), deadline: cfg.task_timeout + cfg.task_grace_period });

	let mut attempt = 0;
	let outcome = loop {
		attempt += 1;
		let task = task.clone();
		let handle = tokio::task::spawn_blocking(move || std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || task())));
		match tokio::time::timeout(cfg.task_timeout, handle).await {
			Ok(Ok(Ok(()))) => break TaskOutcome::Success,
			Ok(Ok(Err(_panic))) if attempt < MAX_TASK_ATTEMPTS => {
				warn!(tier = tier.label(), attempt, "worker task panicked, retrying with backoff");
				tokio::time::sleep(Duration::from_millis(20 * attempt as u64)).await;
				continue;
			},
			Ok(Ok(Err(_panic))) => break TaskOutcome::Failed(attempt),
			Ok(Err(_join_err)) => break TaskOutcome::Failed(attempt),
			Err(_elapsed) => {
				warn!(tier = tier.label(), timeout = ?cfg.task_timeout, "worker task exceeded its timeout");
				break TaskOutcome::Failed(attempt);
			},
		}
	};

	registry.lock().retain(|e| e.id != id);
	in_flight.fetch_sub(1, Ordering::Relaxed);
	match outcome {
		TaskOutcome::Success => {
			processed.fetch_add(1, Ordering::Relaxed);
		},
		TaskOutcome::Failed(attempts) => {
			failed.fetch_add(1, Ordering::Relaxed);
			error!(tier = tier.label(), attempts, "worker task failed after exhausting retries, moving to dead letter");
			dead_letter.lock().push(DeadLetterEntry { tier, attempts, reason: "task panicked or timed out" });
		},
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize as StdAtomicUsize;

	use super::*;

	#[tokio::test]
	async fn submits_and_processes_task() {
		let (_trigger, watcher) = gateway_core::drain::new();
		let mut joinset = JoinSet::new();
		let pool = WorkerPool::start(WorkerPoolConfig::default(), watcher, &mut joinset);

		let done = Arc::new(StdAtomicUsize::new(0));
		let done2 = done.clone();
		pool.submit(Tier::Normal, Arc::new(move || {
			done2.fetch_add(1, Ordering::SeqCst);
		}));

		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(done.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn panicking_task_is_recorded_as_failed_and_dead_lettered() {
		let (_trigger, watcher) = gateway_core::drain::new();
		let mut joinset = JoinSet::new();
		let mut cfg = WorkerPoolConfig::default();
		cfg.low.task_timeout = Duration::from_millis(200);
		let pool = WorkerPool::start(cfg, watcher, &mut joinset);

		pool.submit(Tier::Low, Arc::new(|| panic!("boom")));
		tokio::time::sleep(Duration::from_millis(300)).await;

		let stats = pool.stats();
		let low = stats.iter().find(|s| matches!(s.tier, Tier::Low)).unwrap();
		assert_eq!(low.failed, 1);
		assert_eq!(pool.dead_letter_count(), 1);
	}

	#[tokio::test]
	async fn task_exceeding_timeout_is_marked_failed() {
		let (_trigger, watcher) = gateway_core::drain::new();
		let mut joinset = JoinSet::new();
		let mut cfg = WorkerPoolConfig::default();
		cfg.low.task_timeout = Duration::from_millis(20);
		let pool = WorkerPool::start(cfg, watcher, &mut joinset);

		pool.submit(Tier::Low, Arc::new(|| std::thread::sleep(Duration::from_secs(5))));
		tokio::time::sleep(Duration::from_millis(200)).await;

		let stats = pool.stats();
		let low = stats.iter().find(|s| matches!(s.tier, Tier::Low)).unwrap();
		assert_eq!(low.failed, 1);
	}

	#[tokio::test]
	async fn tier_scales_up_under_sustained_load() {
		let (_trigger, watcher) = gateway_core::drain::new();
		let mut joinset = JoinSet::new();
		let mut cfg = WorkerPoolConfig::default();
		cfg.low.min_workers = 1;
		cfg.low.max_workers = 4;
		cfg.low.scale_up_ratio = 0.5;
		cfg.low.queue_capacity = 16;
		let pool = WorkerPool::start(cfg, watcher, &mut joinset);

		for _ in 0..16 {
			pool.submit(Tier::Low, Arc::new(|| std::thread::sleep(Duration::from_millis(300))));
		}
		tokio::time::sleep(Duration::from_millis(600)).await;

		let stats = pool.stats();
		let low = stats.iter().find(|s| matches!(s.tier, Tier::Low)).unwrap();
		assert!(low.active_workers > 1, "expected tier to scale beyond min_workers, got {}", low.active_workers);
	}

	#[tokio::test]
	async fn sweep_crashed_reports_zero_when_registry_empty() {
		let (_trigger, watcher) = gateway_core::drain::new();
		let mut joinset = JoinSet::new();
		let pool = WorkerPool::start(WorkerPoolConfig::default(), watcher, &mut joinset);
		assert_eq!(pool.sweep_crashed(), 0);
	}
}
