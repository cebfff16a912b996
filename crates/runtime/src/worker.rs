// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Worker state machine and delivery loop.
//!
//! A worker owns the delivery loop of exactly one queue. Its state word
//! is mutated only through compare-and-swap loops; at most one backing
//! thread is inside the loop at any instant. `wake` is safe to call from
//! any thread, including from inside the very handler the worker is
//! executing: a wake while Active moves to ActiveWake so the running loop
//! re-iterates instead of idling, and only an Idle wake requests a new
//! backing thread from the pool.

use std::{
	panic::{AssertUnwindSafe, catch_unwind},
	sync::{
		Arc, Weak,
		atomic::{AtomicU8, Ordering},
	},
	thread::{self, Thread},
	time::{Duration, Instant},
};

use axon_core::Result;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{
	config::WorkerConfig,
	outbox::{FlushOutcome, MessageDeliver, Outbox, RunOne},
	pool::{PoolTask, ThreadPool},
	ring::{OfferError, RingQueue, ShutdownMode},
};

/// Park timeout for permanent workers, which re-arm instead of expiring.
const PERMANENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Consumer callback a worker drains its queue into.
pub trait Deliver<M: MessageDeliver>: Send + 'static {
	fn before_batch(&mut self) {}

	/// Deliver one message. Emitted downstream messages go through the
	/// outbox.
	fn deliver(&mut self, msg: M, outbox: &mut Outbox<M>) -> Result<()>;

	fn after_batch(&mut self) {}

	fn shutdown(&mut self, _mode: ShutdownMode) {}
}

/// Lifecycle states of a worker. No other transitions are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
	/// No backing thread; nothing to do.
	Idle = 0,
	/// A backing thread is inside the delivery loop.
	Active = 1,
	/// Active, with a wake that arrived during the pass. The loop runs
	/// again without re-parking.
	ActiveWake = 2,
	/// The backing thread is parked with a timeout, resumable by unpark.
	Park = 3,
	/// Terminal. Subsequent wakes are no-ops.
	Closed = 4,
}

impl State {
	fn from_u8(value: u8) -> State {
		match value {
			0 => State::Idle,
			1 => State::Active,
			2 => State::ActiveWake,
			3 => State::Park,
			4 => State::Closed,
			_ => unreachable!("invalid worker state {value}"),
		}
	}

	pub fn is_closed(self) -> bool {
		self == State::Closed
	}

	pub fn is_active(self) -> bool {
		matches!(self, State::Active | State::ActiveWake)
	}

	pub fn is_park(self) -> bool {
		self == State::Park
	}

	/// Target state of a wake. Closed absorbs everything.
	fn wake_target(self) -> State {
		match self {
			State::Closed => State::Closed,
			_ => State::ActiveWake,
		}
	}

	/// Target state when the backing thread leaves the loop. A wake that
	/// arrived while exiting sticks, so the caller relaunches.
	fn idle_target(self) -> State {
		match self {
			State::Active | State::Park => State::Idle,
			State::ActiveWake => State::ActiveWake,
			State::Closed => State::Closed,
			State::Idle => State::Idle,
		}
	}
}

/// Atomic worker state word. All transitions are CAS retry loops.
pub struct WorkerState(AtomicU8);

impl WorkerState {
	pub fn new() -> Self {
		Self(AtomicU8::new(State::Idle as u8))
	}

	pub fn load(&self) -> State {
		State::from_u8(self.0.load(Ordering::Acquire))
	}

	fn cas(&self, from: State, to: State) -> bool {
		self.0
			.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	/// Apply a wake. Returns the previous state so the caller can decide
	/// between launching a thread (Idle) and unparking (Park).
	pub fn wake(&self) -> State {
		loop {
			let old = self.load();
			if self.cas(old, old.wake_target()) {
				return old;
			}
		}
	}

	/// Move any non-closed state to Active. False once closed.
	pub fn activate(&self) -> bool {
		loop {
			let old = self.load();
			if old.is_closed() {
				return false;
			}
			if self.cas(old, State::Active) {
				return true;
			}
		}
	}

	/// Consume a wake that arrived during the pass. True if the loop
	/// must run again.
	pub fn ack_wake(&self) -> bool {
		self.cas(State::ActiveWake, State::Active)
	}

	pub fn try_park(&self) -> bool {
		self.cas(State::Active, State::Park)
	}

	pub fn try_unpark(&self) -> bool {
		self.cas(State::Park, State::Active)
	}

	/// Claim an idle worker for inline execution.
	pub fn try_claim(&self) -> bool {
		self.cas(State::Idle, State::Active)
	}

	/// Leave the loop. Returns the new state; ActiveWake means a wake
	/// raced the exit and the worker must be relaunched.
	pub fn idle(&self) -> State {
		loop {
			let old = self.load();
			let new = old.idle_target();
			if self.cas(old, new) {
				return new;
			}
		}
	}

	/// Terminal transition. Returns the previous state.
	pub fn close(&self) -> State {
		State::from_u8(self.0.swap(State::Closed as u8, Ordering::AcqRel))
	}
}

impl Default for WorkerState {
	fn default() -> Self {
		Self::new()
	}
}

/// Owns the delivery loop of one queue.
pub struct Worker<M: MessageDeliver, D: Deliver<M>> {
	name: String,
	me: Weak<Self>,
	queue: Arc<RingQueue<M>>,
	deliver: Mutex<D>,
	state: WorkerState,
	/// Backing thread handle while one is bound, for unpark.
	thread: Mutex<Option<Thread>>,
	pool: ThreadPool,
	idle_timeout: Option<Duration>,
	permanent: bool,
	batch_max: usize,
}

impl<M: MessageDeliver, D: Deliver<M>> Worker<M, D> {
	pub fn new(
		name: impl Into<String>,
		queue: Arc<RingQueue<M>>,
		deliver: D,
		pool: ThreadPool,
		config: &WorkerConfig,
	) -> Arc<Self> {
		Arc::new_cyclic(|me| Self {
			name: name.into(),
			me: me.clone(),
			queue,
			deliver: Mutex::new(deliver),
			state: WorkerState::new(),
			thread: Mutex::new(None),
			pool,
			idle_timeout: config.idle_timeout,
			permanent: config.permanent,
			batch_max: config.batch_max,
		})
	}

	pub fn state(&self) -> State {
		self.state.load()
	}

	pub fn is_closed(&self) -> bool {
		self.state.load().is_closed()
	}

	pub fn is_task_active(&self) -> bool {
		let state = self.state.load();
		state.is_active() || state.is_park()
	}

	pub fn queue(&self) -> &Arc<RingQueue<M>> {
		&self.queue
	}

	/// Signal that the queue has work.
	///
	/// Safe to call concurrently from any thread; the signal is neither
	/// lost nor double-served.
	pub fn wake(&self) {
		if self.is_closed() {
			return;
		}

		match self.state.wake() {
			State::Idle => self.start_worker_thread(),
			State::Park => {
				if let Some(thread) = self.thread.lock().as_ref() {
					thread.unpark();
				}
			}
			_ => {}
		}
	}

	/// Terminal close. Unparks a parked backing thread so it observes
	/// closure.
	pub fn close(&self) {
		self.state.close();

		if let Some(thread) = self.thread.lock().as_ref() {
			thread.unpark();
		}
	}

	/// Close and notify the consumer callback.
	pub fn shutdown(&self, mode: ShutdownMode) {
		self.close();
		self.deliver.lock().shutdown(mode);
	}

	/// Bounded wait until the queue is drained. Used on graceful
	/// shutdown, off the delivery path.
	pub fn drain_wait(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;

		while !self.queue.is_empty() {
			if Instant::now() >= deadline {
				return false;
			}
			thread::sleep(Duration::from_millis(1));
		}

		true
	}

	fn start_worker_thread(&self) {
		if let Some(me) = self.me.upgrade() {
			self.pool.execute(me);
		}
	}

	fn effective_idle_timeout(&self) -> Option<Duration> {
		if self.permanent {
			Some(PERMANENT_TIMEOUT)
		} else {
			self.idle_timeout
		}
	}

	fn is_retry(&self) -> bool {
		!self.queue.is_empty()
	}

	/// One delivery pass: drain up to `batch_max`, then flush the outbox
	/// until it is fully drained.
	fn run_task(&self) {
		loop {
			let mut outbox = Outbox::new();

			let delivered = {
				let mut deliver = self.deliver.lock();
				deliver.before_batch();
				let delivered = self.queue.deliver(&mut *deliver, &mut outbox, self.batch_max);
				deliver.after_batch();
				delivered
			};

			loop {
				match outbox.flush_and_execute_last() {
					FlushOutcome::Drained => break,
					FlushOutcome::MoreWork => {}
				}
			}

			if delivered < self.batch_max {
				break;
			}
		}
	}

	/// Backing thread body. Entered through the pool.
	fn run(&self) {
		{
			let mut cell = self.thread.lock();
			if cell.is_some() {
				// two backing threads bound to one worker means the CAS
				// protocol is broken; surface it loudly
				error!(worker = %self.name, "DOUBLE_THREAD: second backing thread entered the delivery loop");
				debug_assert!(false, "two backing threads bound to worker {}", self.name);
			}
			*cell = Some(thread::current());
		}

		let idle_timeout = self.effective_idle_timeout();
		let mut expires = idle_timeout.map(|t| Instant::now() + t);

		'run: loop {
			if !self.state.activate() {
				break;
			}

			loop {
				if self.state.load().is_closed() {
					break 'run;
				}

				if catch_unwind(AssertUnwindSafe(|| self.run_task())).is_err() {
					error!(worker = %self.name, "delivery task panicked; loop continues");
				}

				expires = idle_timeout.map(|t| Instant::now() + t);

				if !self.state.ack_wake() {
					break;
				}
			}

			if let Some(expire) = expires {
				if self.state.try_park() {
					if !self.is_retry() && self.state.load() == State::Park {
						let now = Instant::now();
						if expire > now {
							thread::park_timeout(expire - now);
						}
					}
					self.state.try_unpark();
				}
			}

			let now = Instant::now();

			if self.permanent {
				expires = idle_timeout.map(|t| now + t);
			}

			let rerun = self.permanent
				|| expires.is_some_and(|e| now < e)
				|| self.state.load() == State::ActiveWake
				|| self.is_retry();

			if !rerun {
				break;
			}
		}

		*self.thread.lock() = None;

		if self.state.idle() == State::ActiveWake {
			debug!(worker = %self.name, "wake raced loop exit; relaunching");
			self.start_worker_thread();
		}
	}

	/// Execute `tail` inline on the calling thread if this worker is
	/// idle.
	///
	/// The tail message is delivered inline only when the queue is
	/// empty; otherwise it is offered into the queue to preserve
	/// ordering, and if that offer fails it is handed back so the caller
	/// retries instead of losing it.
	pub fn run_one(&self, tail: M, outbox: &mut Outbox<M>) -> RunOne<M> {
		if !self.state.try_claim() {
			// a backing thread owns the loop; fall back to the queue
			return match self.queue.try_offer(tail) {
				Ok(()) => {
					self.wake();
					RunOne::Done
				}
				Err(OfferError::Full(msg)) => {
					self.wake();
					RunOne::Retry(msg)
				}
				Err(OfferError::Closed(msg)) => {
					debug!(worker = %self.name, "inline message dropped: queue closed");
					drop(msg);
					RunOne::Done
				}
			};
		}

		let step = {
			let mut deliver = self.deliver.lock();
			deliver.before_batch();

			let step = if self.queue.is_empty() {
				if let Err(error) = deliver.deliver(tail, outbox) {
					error!(worker = %self.name, %error, "inline delivery failed");
				}
				RunOneStep::Inline
			} else {
				match self.queue.try_offer(tail) {
					Ok(()) => RunOneStep::Queued,
					Err(OfferError::Full(msg)) => RunOneStep::Full(msg),
					Err(OfferError::Closed(msg)) => RunOneStep::Closed(msg),
				}
			};

			deliver.after_batch();
			step
		};

		if self.state.idle() == State::ActiveWake {
			self.start_worker_thread();
		}

		match step {
			RunOneStep::Inline => RunOne::Done,
			RunOneStep::Queued => {
				self.wake();
				RunOne::Done
			}
			RunOneStep::Full(msg) => {
				self.wake();
				RunOne::Retry(msg)
			}
			RunOneStep::Closed(msg) => {
				debug!(worker = %self.name, "inline message dropped: queue closed");
				drop(msg);
				RunOne::Done
			}
		}
	}
}

enum RunOneStep<M> {
	Inline,
	Queued,
	Full(M),
	Closed(M),
}

impl<M: MessageDeliver, D: Deliver<M>> PoolTask for Worker<M, D> {
	fn execute(self: Arc<Self>) {
		self.run();
	}

	fn name(&self) -> &str {
		&self.name
	}
}
