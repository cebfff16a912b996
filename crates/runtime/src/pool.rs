// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Backing thread pool and its launcher.
//!
//! Workers enqueue themselves as tasks on a shared run queue; idle pool
//! threads block on it with a timeout and expire when the pool has more
//! idle capacity than configured. The launcher decides on its own
//! dedicated control thread whether a start request may actually spawn,
//! honoring `thread_max`, the idle bounds and a creation-rate throttle.
//! OS thread spawn never happens on the delivery hot path.

use std::{
	panic::{AssertUnwindSafe, catch_unwind},
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering},
	},
	thread::{self, JoinHandle, Thread},
	time::{Duration, Instant},
};

use axon_core::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{
	config::{DEFAULT_IDLE_MAX, DEFAULT_IDLE_MIN, DEFAULT_THREAD_MAX, PoolConfig},
	worker::{State, WorkerState},
};

/// A unit of work executed on a pool thread.
pub trait PoolTask: Send + Sync + 'static {
	fn execute(self: Arc<Self>);

	fn name(&self) -> &str {
		"pool-task"
	}
}

/// Task sent on close so idle threads observe shutdown promptly.
struct WakeTask;

impl PoolTask for WakeTask {
	fn execute(self: Arc<Self>) {}

	fn name(&self) -> &str {
		"pool-wake"
	}
}

struct ThrottleWindow {
	start: Option<Instant>,
	count: usize,
	throttled: bool,
}

struct PoolInner {
	// live-settable bounds
	thread_max: AtomicUsize,
	idle_min: AtomicUsize,
	idle_max: AtomicUsize,

	idle_timeout: Duration,
	throttle_period: Duration,
	throttle_limit: usize,
	throttle_sleep: Duration,

	// lifetime counters; threads report transitions only through the
	// callback pairs below
	thread_count: AtomicUsize,
	idle_count: AtomicUsize,
	/// Threads asked to launch that have not reported in yet.
	starting_count: AtomicIsize,
	create_count_total: AtomicU64,

	/// Next time an idle thread may expire, in millis since `base`.
	/// Shared CAS; racing threads can agree to expire together and
	/// transiently undershoot `idle_min`.
	idle_expire_at: AtomicU64,
	base: Instant,

	throttle: Mutex<ThrottleWindow>,
	gen_id: AtomicUsize,
	running: AtomicBool,

	tasks_tx: Sender<Arc<dyn PoolTask>>,
	tasks_rx: Receiver<Arc<dyn PoolTask>>,

	launcher_state: WorkerState,
	launcher_thread: Mutex<Option<Thread>>,
	launcher_join: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the backing thread pool.
#[derive(Clone)]
pub struct ThreadPool {
	inner: Arc<PoolInner>,
}

impl ThreadPool {
	pub fn new(config: PoolConfig) -> Result<Self> {
		config.validate()?;

		let (tasks_tx, tasks_rx) = unbounded();

		Ok(Self {
			inner: Arc::new(PoolInner {
				thread_max: AtomicUsize::new(config.thread_max),
				idle_min: AtomicUsize::new(config.idle_min),
				idle_max: AtomicUsize::new(config.idle_max),
				idle_timeout: config.idle_timeout,
				throttle_period: config.throttle_period,
				throttle_limit: config.throttle_limit,
				throttle_sleep: config.throttle_sleep,
				thread_count: AtomicUsize::new(0),
				idle_count: AtomicUsize::new(0),
				starting_count: AtomicIsize::new(0),
				create_count_total: AtomicU64::new(0),
				idle_expire_at: AtomicU64::new(0),
				base: Instant::now(),
				throttle: Mutex::new(ThrottleWindow {
					start: None,
					count: 0,
					throttled: false,
				}),
				gen_id: AtomicUsize::new(0),
				running: AtomicBool::new(false),
				tasks_tx,
				tasks_rx,
				launcher_state: WorkerState::new(),
				launcher_thread: Mutex::new(None),
				launcher_join: Mutex::new(None),
			}),
		})
	}

	/// Start the launcher control thread and pre-warm the idle pool.
	pub fn start(&self) {
		if self.inner.running.swap(true, Ordering::AcqRel) {
			return;
		}

		let inner = Arc::clone(&self.inner);
		let handle = thread::Builder::new()
			.name("axon-launcher".to_string())
			.spawn(move || launcher_loop(inner))
			.expect("failed to spawn launcher thread");

		*self.inner.launcher_join.lock() = Some(handle);

		self.inner.update_idle_expire_time();
		self.inner.wake_launcher();
	}

	pub fn is_running(&self) -> bool {
		self.inner.running.load(Ordering::Acquire)
	}

	/// Submit a task. An idle thread picks it up directly; the launcher
	/// is woken when the idle pool runs low. Tasks submitted before
	/// `start` stay queued until the pool runs.
	pub fn execute(&self, task: Arc<dyn PoolTask>) {
		if !self.is_running() {
			debug!(task = task.name(), "pool not running; task stays queued");
		}

		if self.inner.tasks_tx.send(task).is_err() {
			error!("pool run queue disconnected");
			return;
		}

		self.inner.wake_if_low_idle();
	}

	/// Ask the launcher whether another thread may start. Reserves a
	/// starting slot on success; refused requests are retried once an
	/// existing thread frees up.
	pub fn request_start(&self) -> bool {
		self.inner.request_start()
	}

	/// Stop the pool. Idle threads are woken so they observe shutdown.
	pub fn close(&self) {
		if !self.inner.running.swap(false, Ordering::AcqRel) {
			return;
		}

		self.inner.launcher_state.close();
		if let Some(thread) = self.inner.launcher_thread.lock().as_ref() {
			thread.unpark();
		}

		if let Some(handle) = self.inner.launcher_join.lock().take() {
			let _ = handle.join();
		}

		let live = self.inner.thread_count.load(Ordering::Acquire);
		for _ in 0..live {
			let _ = self.inner.tasks_tx.send(Arc::new(WakeTask));
		}
	}

	//
	// configuration
	//

	pub fn set_thread_max(&self, max: usize) -> Result<()> {
		let current = self.inner.thread_max.load(Ordering::Acquire);
		if max == current {
			// no-op guard: skip recomputation when unchanged
			return Ok(());
		}

		let max = if max == 0 {
			DEFAULT_THREAD_MAX
		} else {
			max
		};

		let idle_min = self.inner.idle_min.load(Ordering::Acquire);
		if max < idle_min {
			return Err(Error::Config(format!(
				"idle_min ({}) must not exceed thread_max ({})",
				idle_min, max
			)));
		}

		self.inner.thread_max.store(max, Ordering::Release);
		self.inner.update();
		Ok(())
	}

	pub fn set_idle_min(&self, min: usize) -> Result<()> {
		let current = self.inner.idle_min.load(Ordering::Acquire);
		if min == current {
			return Ok(());
		}

		let min = if min == 0 {
			DEFAULT_IDLE_MIN
		} else {
			min
		};

		let thread_max = self.inner.thread_max.load(Ordering::Acquire);
		if thread_max < min {
			return Err(Error::Config(format!(
				"idle_min ({}) must not exceed thread_max ({})",
				min, thread_max
			)));
		}

		self.inner.idle_min.store(min, Ordering::Release);
		self.inner.update();
		Ok(())
	}

	pub fn set_idle_max(&self, max: usize) -> Result<()> {
		let current = self.inner.idle_max.load(Ordering::Acquire);
		if max == current {
			return Ok(());
		}

		let max = if max == 0 {
			DEFAULT_IDLE_MAX
		} else {
			max
		};

		let thread_max = self.inner.thread_max.load(Ordering::Acquire);
		if max != DEFAULT_IDLE_MAX && thread_max < max {
			return Err(Error::Config(format!(
				"idle_max ({}) must not exceed thread_max ({}) when finite",
				max, thread_max
			)));
		}

		self.inner.idle_max.store(max, Ordering::Release);
		self.inner.update();
		Ok(())
	}

	pub fn reset_throttle(&self) {
		let mut throttle = self.inner.throttle.lock();
		throttle.count = 0;
		throttle.throttled = false;
	}

	//
	// housekeeping for threads managed by, but not spawned by, the pool
	//

	pub fn on_child_thread_resume_begin(&self) {
		self.inner.thread_count.fetch_add(1, Ordering::AcqRel);
	}

	pub fn on_child_thread_resume_end(&self) {
		let previous = self.inner.thread_count.fetch_sub(1, Ordering::AcqRel);

		if self.inner.thread_max.load(Ordering::Acquire) <= previous {
			self.inner.wake_launcher();
		}

		self.inner.wake_if_low_idle();
	}

	//
	// statistics
	//

	pub fn thread_count(&self) -> usize {
		self.inner.thread_count.load(Ordering::Acquire)
	}

	pub fn idle_count(&self) -> usize {
		self.inner.idle_count.load(Ordering::Acquire)
	}

	pub fn starting_count(&self) -> usize {
		self.inner.starting_count.load(Ordering::Acquire).max(0) as usize
	}

	pub fn create_count_total(&self) -> u64 {
		self.inner.create_count_total.load(Ordering::Acquire)
	}

	pub fn thread_max(&self) -> usize {
		self.inner.thread_max.load(Ordering::Acquire)
	}

	pub fn idle_min(&self) -> usize {
		self.inner.idle_min.load(Ordering::Acquire)
	}

	pub fn idle_max(&self) -> usize {
		self.inner.idle_max.load(Ordering::Acquire)
	}

	pub fn is_thread_max(&self) -> bool {
		self.thread_max() <= self.thread_count() + self.starting_count()
	}

	pub fn is_thread_high(&self) -> bool {
		self.thread_max() < 2 * (self.thread_count() + self.starting_count())
	}

	pub fn is_idle_low(&self) -> bool {
		self.idle_count() < self.idle_min()
	}
}

impl PoolInner {
	fn elapsed_millis(&self) -> u64 {
		self.base.elapsed().as_millis() as u64
	}

	fn update_idle_expire_time(&self) {
		let next = self.elapsed_millis() + self.idle_timeout.as_millis() as u64;
		self.idle_expire_at.store(next, Ordering::Release);
	}

	fn update(&self) {
		self.update_idle_expire_time();
		self.wake_launcher();
	}

	fn wake_launcher(&self) {
		if self.launcher_state.wake() == State::Park {
			if let Some(thread) = self.launcher_thread.lock().as_ref() {
				thread.unpark();
			}
		}
	}

	fn wake_if_low_idle(&self) {
		let idle = self.idle_count.load(Ordering::Acquire);
		let starting = self.starting_count.load(Ordering::Acquire).max(0) as usize;

		if idle + starting < self.idle_min.load(Ordering::Acquire) {
			self.update_idle_expire_time();
			self.wake_launcher();
		}
	}

	/// The launcher's scheduling decision. Lock-free: a starting slot is
	/// reserved first and rolled back if a bound refuses it.
	fn request_start(&self) -> bool {
		if !self.running.load(Ordering::Acquire) {
			return false;
		}

		let starting = self.starting_count.fetch_add(1, Ordering::AcqRel) + 1;
		let threads = self.thread_count.load(Ordering::Acquire) + starting.max(0) as usize;

		if self.thread_max.load(Ordering::Acquire) < threads {
			self.starting_count.fetch_sub(1, Ordering::AcqRel);
			self.on_thread_max();
			return false;
		}

		if self.is_idle_too_low(starting.max(1) as usize - 1) {
			return true;
		}

		self.starting_count.fetch_sub(1, Ordering::AcqRel);
		false
	}

	fn is_idle_too_low(&self, starting: usize) -> bool {
		self.idle_count.load(Ordering::Acquire) + starting < self.idle_min.load(Ordering::Acquire)
	}

	fn on_thread_max(&self) {
		trace!("thread_max reached; start request refused");
	}

	fn on_start_fail(&self) {
		self.starting_count.fetch_sub(1, Ordering::AcqRel);
	}

	/// Callback from a launched thread's run. Must not be called from
	/// anywhere else.
	fn on_child_thread_launch_begin(&self) {
		self.thread_count.fetch_add(1, Ordering::AcqRel);

		let starting = self.starting_count.fetch_sub(1, Ordering::AcqRel) - 1;
		if starting < 0 {
			self.starting_count.store(0, Ordering::Release);
			error!("starting count went negative; launcher bookkeeping is broken");
			debug_assert!(false, "negative starting count");
		}

		self.create_count_total.fetch_add(1, Ordering::AcqRel);
		self.wake_if_low_idle();
	}

	/// Callback from a launched thread's exit. Wakes the launcher when
	/// the pool had been saturated so refused start requests get retried.
	fn on_child_thread_launch_end(&self) {
		let previous = self.thread_count.fetch_sub(1, Ordering::AcqRel);

		if self.thread_max.load(Ordering::Acquire) <= previous {
			self.wake_launcher();
		}

		self.wake_if_low_idle();
	}

	fn on_child_idle_begin(&self) {
		self.idle_count.fetch_add(1, Ordering::AcqRel);
	}

	fn on_child_idle_end(&self) {
		self.idle_count.fetch_sub(1, Ordering::AcqRel);
		self.wake_if_low_idle();
	}

	/// Whether an idle thread should exit instead of re-parking.
	///
	/// The shared next-expire CAS can race several threads into expiring
	/// in the same window, undershooting `idle_min`; the low-idle wake
	/// replenishes afterwards. Deliberately kept.
	fn is_idle_expire(&self) -> bool {
		if !self.running.load(Ordering::Acquire) {
			return true;
		}

		let now = self.elapsed_millis();
		let idle_expire = self.idle_expire_at.load(Ordering::Acquire);
		let idle_count = self.idle_count.load(Ordering::Acquire);
		let idle_min = self.idle_min.load(Ordering::Acquire);
		let idle_max = self.idle_max.load(Ordering::Acquire);

		if idle_min < idle_count {
			let next = now + self.idle_timeout.as_millis() as u64;

			if idle_max < idle_count && idle_min < idle_max {
				// excess idle threads expire opportunistically
				let _ = self.idle_expire_at.compare_exchange(
					idle_expire,
					next,
					Ordering::AcqRel,
					Ordering::Acquire,
				);
				return true;
			}

			if idle_expire < now
				&& self.idle_expire_at
					.compare_exchange(idle_expire, next, Ordering::AcqRel, Ordering::Acquire)
					.is_ok()
			{
				return true;
			}
		}

		false
	}

	/// Bound how fast the pool may grow during a spike. Warns once per
	/// throttle episode, re-armed when the window resets.
	fn update_throttle(&self) {
		let mut throttle = self.throttle.lock();
		let now = Instant::now();

		let in_window = match throttle.start {
			Some(start) => now.duration_since(start) <= self.throttle_period,
			None => false,
		};

		if !in_window {
			throttle.start = Some(now);
			throttle.count = 1;
			throttle.throttled = false;
			return;
		}

		throttle.count += 1;

		if throttle.count < self.throttle_limit {
			return;
		}

		if !throttle.throttled {
			throttle.throttled = true;
			warn!(
				created = throttle.count,
				period_ms = self.throttle_period.as_millis() as u64,
				sleep_ms = self.throttle_sleep.as_millis() as u64,
				"thread creation throttled"
			);
		}

		let sleep = self.throttle_sleep;
		drop(throttle);

		if !sleep.is_zero() {
			thread::sleep(sleep);
		}
	}
}

/// Control loop of the launcher's dedicated thread. Spawning is a
/// blocking, comparatively expensive operation and only ever happens
/// here.
fn launcher_loop(inner: Arc<PoolInner>) {
	*inner.launcher_thread.lock() = Some(thread::current());
	debug!("launcher started");

	'run: loop {
		if !inner.launcher_state.activate() {
			break;
		}

		loop {
			if inner.launcher_state.load().is_closed() {
				break 'run;
			}

			start_connection(&inner);

			if !inner.launcher_state.ack_wake() {
				break;
			}
		}

		if inner.launcher_state.try_park() {
			if inner.launcher_state.load() == State::Park {
				thread::park();
			}
			inner.launcher_state.try_unpark();
		}

		if inner.launcher_state.load().is_closed() {
			break;
		}
	}

	*inner.launcher_thread.lock() = None;
	debug!("launcher stopped");
}

/// Spawn threads while the launcher's decision allows it.
fn start_connection(inner: &Arc<PoolInner>) {
	while inner.request_start() {
		inner.update_idle_expire_time();

		let id = inner.gen_id.fetch_add(1, Ordering::AcqRel) + 1;

		inner.update_throttle();

		if !launch_child_thread(inner, id) {
			inner.on_start_fail();
			break;
		}
	}
}

fn launch_child_thread(inner: &Arc<PoolInner>, id: usize) -> bool {
	let child = Arc::clone(inner);

	match thread::Builder::new().name(format!("axon-pool-{}", id)).spawn(move || child_loop(child)) {
		Ok(_detached) => true,
		Err(error) => {
			error!(%error, id, "failed to spawn pool thread");
			false
		}
	}
}

/// Body of a pool thread: block on the run queue while idle, execute
/// tasks, expire when the pool has idle threads to spare.
fn child_loop(inner: Arc<PoolInner>) {
	inner.on_child_thread_launch_begin();
	trace!("pool thread started");

	loop {
		if !inner.running.load(Ordering::Acquire) {
			break;
		}

		inner.on_child_idle_begin();
		let received = inner.tasks_rx.recv_timeout(inner.idle_timeout);

		match received {
			Ok(task) => {
				inner.on_child_idle_end();

				let name = task.name().to_string();
				if catch_unwind(AssertUnwindSafe(move || task.execute())).is_err() {
					error!(task = %name, "pool task panicked");
				}
			}
			Err(RecvTimeoutError::Timeout) => {
				let expire = inner.is_idle_expire();
				inner.on_child_idle_end();

				if expire {
					break;
				}
			}
			Err(RecvTimeoutError::Disconnected) => {
				inner.on_child_idle_end();
				break;
			}
		}
	}

	inner.on_child_thread_launch_end();
	trace!("pool thread stopped");
}

#[cfg(test)]
mod tests {
	use std::sync::{Barrier, mpsc};

	use super::*;

	fn config(thread_max: usize, idle_min: usize) -> PoolConfig {
		PoolConfig {
			thread_max,
			idle_min,
			idle_max: thread_max,
			idle_timeout: Duration::from_millis(100),
			..Default::default()
		}
	}

	#[test]
	fn test_request_start_reserves_exactly_one_slot() {
		let pool = ThreadPool::new(config(1, 1)).unwrap();
		// mark running without spawning anything so the counters stay
		// fully under test control
		pool.inner.running.store(true, Ordering::Release);

		let barrier = Arc::new(Barrier::new(2));
		let successes = Arc::new(AtomicUsize::new(0));

		let contenders: Vec<_> = (0..2)
			.map(|_| {
				let pool = pool.clone();
				let barrier = Arc::clone(&barrier);
				let successes = Arc::clone(&successes);
				thread::spawn(move || {
					barrier.wait();
					if pool.request_start() {
						successes.fetch_add(1, Ordering::SeqCst);
					}
				})
			})
			.collect();

		for contender in contenders {
			contender.join().unwrap();
		}

		assert_eq!(
			successes.load(Ordering::SeqCst),
			1,
			"with thread_max=1 exactly one concurrent request may win"
		);
		assert_eq!(pool.starting_count(), 1);
	}

	#[test]
	fn test_request_start_refused_when_idle_is_covered() {
		let pool = ThreadPool::new(config(8, 1)).unwrap();
		pool.inner.running.store(true, Ordering::Release);

		// enough idle threads already: no growth
		pool.inner.idle_count.store(3, Ordering::Release);

		assert!(!pool.request_start());
		assert_eq!(pool.starting_count(), 0, "refusal must roll the reservation back");
	}

	#[test]
	fn test_request_start_refused_when_not_running() {
		let pool = ThreadPool::new(config(4, 2)).unwrap();
		assert!(!pool.request_start());
	}

	#[test]
	fn test_setter_validation() {
		let pool = ThreadPool::new(config(8, 2)).unwrap();

		assert!(matches!(pool.set_thread_max(1), Err(Error::Config(_))));
		assert!(matches!(pool.set_idle_min(9), Err(Error::Config(_))));
		assert!(matches!(pool.set_idle_max(16), Err(Error::Config(_))));

		// no-op guard
		assert!(pool.set_thread_max(8).is_ok());

		assert!(pool.set_idle_min(4).is_ok());
		assert_eq!(pool.idle_min(), 4);

		// zero resets to the default
		assert!(pool.set_thread_max(0).is_ok());
		assert_eq!(pool.thread_max(), DEFAULT_THREAD_MAX);
	}

	#[test]
	fn test_execute_runs_task() {
		struct SignalTask(mpsc::Sender<thread::ThreadId>);

		impl PoolTask for SignalTask {
			fn execute(self: Arc<Self>) {
				let _ = self.0.send(thread::current().id());
			}
		}

		let pool = ThreadPool::new(config(4, 1)).unwrap();
		pool.start();

		let (tx, rx) = mpsc::channel();
		pool.execute(Arc::new(SignalTask(tx.clone())));

		let on_pool_thread = rx.recv_timeout(Duration::from_secs(5)).expect("task must run");
		assert_ne!(on_pool_thread, thread::current().id(), "tasks run on pool threads");

		pool.close();
	}

	#[test]
	fn test_pool_bounds_hold_under_load() {
		struct BusyTask(Duration);

		impl PoolTask for BusyTask {
			fn execute(self: Arc<Self>) {
				thread::sleep(self.0);
			}
		}

		let pool = ThreadPool::new(config(2, 1)).unwrap();
		pool.start();

		for _ in 0..16 {
			pool.execute(Arc::new(BusyTask(Duration::from_millis(10))));
		}

		for _ in 0..50 {
			let live = pool.thread_count() + pool.starting_count();
			assert!(live <= 2, "thread_count + starting_count exceeded thread_max: {}", live);
			thread::sleep(Duration::from_millis(2));
		}

		pool.close();
	}

	#[test]
	fn test_idle_threads_expire_back_toward_bounds() {
		struct BusyTask(Duration);

		impl PoolTask for BusyTask {
			fn execute(self: Arc<Self>) {
				thread::sleep(self.0);
			}
		}

		let pool = ThreadPool::new(PoolConfig {
			thread_max: 4,
			idle_min: 1,
			idle_max: 1,
			idle_timeout: Duration::from_millis(30),
			..Default::default()
		})
		.unwrap();
		pool.start();

		// grow the pool by keeping several threads busy at once
		for _ in 0..8 {
			pool.execute(Arc::new(BusyTask(Duration::from_millis(50))));
		}

		thread::sleep(Duration::from_millis(120));
		let grown = pool.thread_count();
		assert!(grown >= 2, "pool should have grown under load, got {}", grown);

		// after the burst, excess idle threads expire; the shared
		// expire-time CAS may let several go at once, so only assert
		// shrinkage, not an exact floor
		let mut shrunk = pool.thread_count();
		for _ in 0..100 {
			shrunk = pool.thread_count();
			if shrunk <= 2 {
				break;
			}
			thread::sleep(Duration::from_millis(10));
		}
		assert!(shrunk <= 2, "idle threads should expire, still {}", shrunk);

		pool.close();
	}

	#[test]
	fn test_close_is_idempotent() {
		let pool = ThreadPool::new(config(2, 1)).unwrap();
		pool.start();
		pool.close();
		pool.close();
		assert!(!pool.is_running());
	}
}
