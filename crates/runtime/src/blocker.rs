// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Ring wait/wake primitive.
//!
//! Coordinates producers blocked on a full ring and consumers blocked on
//! an empty one. Waits are sequence-epoch based: a waiter first reads the
//! current epoch, re-checks the ring, then parks until the epoch moves,
//! the timeout elapses or the queue shuts down. This closes the missed
//! wakeup window without holding a lock across the ring check.

use std::{
	sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
	time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::ring::ShutdownMode;

/// Wait/wake coordination for one ring.
pub trait RingBlocker: Send + Sync + 'static {
	/// Current offer-side epoch. Read before re-checking the ring.
	fn next_offer_sequence(&self) -> u64;

	/// Park until the offer-side epoch moves past `sequence`. Returns
	/// false if the timeout elapsed (or this blocker never waits).
	/// `None` waits indefinitely; non-blocking callers must not call
	/// this at all.
	fn offer_wait(&self, sequence: u64, timeout: Option<Duration>) -> bool;

	/// Release producers parked on a full ring.
	fn offer_wake(&self);

	/// Current poll-side epoch.
	fn next_poll_sequence(&self) -> u64;

	/// Park until the poll-side epoch moves past `sequence`.
	fn poll_wait(&self, sequence: u64, timeout: Option<Duration>) -> bool;

	/// Whether any consumer is currently parked on the poll side.
	fn is_poll_wait(&self) -> bool;

	/// Release consumers parked on an empty ring.
	fn poll_wake(&self);

	/// Broad wakeup of both sides.
	fn wake(&self);

	fn wake_all(&self);

	/// Re-arm after a shutdown was observed and handled.
	fn on_active(&self) {}

	/// Wake everything so parked threads observe closure.
	fn shutdown(&self, mode: ShutdownMode);
}

struct WaitSide {
	epoch: AtomicU64,
	waiters: AtomicU32,
	sleep: Mutex<()>,
	available: Condvar,
}

impl WaitSide {
	fn new() -> Self {
		Self {
			epoch: AtomicU64::new(0),
			waiters: AtomicU32::new(0),
			sleep: Mutex::new(()),
			available: Condvar::new(),
		}
	}

	fn next_sequence(&self) -> u64 {
		self.epoch.load(Ordering::SeqCst)
	}

	fn wait(&self, sequence: u64, timeout: Option<Duration>, closed: &AtomicBool) -> bool {
		let mut guard = self.sleep.lock();

		// register before the final epoch check; with the waker's
		// bump-then-check order (both SeqCst) one side always observes
		// the other, so a wake cannot slip between check and sleep
		self.waiters.fetch_add(1, Ordering::SeqCst);

		let woken = if self.epoch.load(Ordering::SeqCst) != sequence || closed.load(Ordering::Acquire) {
			true
		} else {
			match timeout {
				None => {
					self.available.wait(&mut guard);
					true
				}
				Some(timeout) => !self.available.wait_for(&mut guard, timeout).timed_out(),
			}
		};

		self.waiters.fetch_sub(1, Ordering::SeqCst);

		woken || self.epoch.load(Ordering::SeqCst) != sequence
	}

	/// Lock-free unless someone is actually parked.
	fn wake(&self) {
		self.epoch.fetch_add(1, Ordering::SeqCst);

		if self.waiters.load(Ordering::SeqCst) > 0 {
			let _guard = self.sleep.lock();
			self.available.notify_all();
		}
	}

	fn is_waiting(&self) -> bool {
		self.waiters.load(Ordering::SeqCst) > 0
	}
}

/// Blocking wait/wake built on a mutex/condvar pair per side.
pub struct CondvarBlocker {
	offer: WaitSide,
	poll: WaitSide,
	closed: AtomicBool,
}

impl CondvarBlocker {
	pub fn new() -> Self {
		Self {
			offer: WaitSide::new(),
			poll: WaitSide::new(),
			closed: AtomicBool::new(false),
		}
	}
}

impl Default for CondvarBlocker {
	fn default() -> Self {
		Self::new()
	}
}

impl RingBlocker for CondvarBlocker {
	fn next_offer_sequence(&self) -> u64 {
		self.offer.next_sequence()
	}

	fn offer_wait(&self, sequence: u64, timeout: Option<Duration>) -> bool {
		self.offer.wait(sequence, timeout, &self.closed)
	}

	fn offer_wake(&self) {
		self.offer.wake();
	}

	fn next_poll_sequence(&self) -> u64 {
		self.poll.next_sequence()
	}

	fn poll_wait(&self, sequence: u64, timeout: Option<Duration>) -> bool {
		self.poll.wait(sequence, timeout, &self.closed)
	}

	fn is_poll_wait(&self) -> bool {
		self.poll.is_waiting()
	}

	fn poll_wake(&self) {
		self.poll.wake();
	}

	fn wake(&self) {
		self.offer.wake();
		self.poll.wake();
	}

	fn wake_all(&self) {
		self.wake();
	}

	fn on_active(&self) {
		self.closed.store(false, Ordering::Release);
	}

	fn shutdown(&self, _mode: ShutdownMode) {
		self.closed.store(true, Ordering::Release);
		self.wake_all();
	}
}

/// Blocker that never blocks and always reports "not waiting".
///
/// Used when a queue is coordinated purely by wake signaling, never by
/// parking producers or consumers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBlocker;

impl RingBlocker for NullBlocker {
	fn next_offer_sequence(&self) -> u64 {
		0
	}

	fn offer_wait(&self, _sequence: u64, _timeout: Option<Duration>) -> bool {
		false
	}

	fn offer_wake(&self) {}

	fn next_poll_sequence(&self) -> u64 {
		0
	}

	fn poll_wait(&self, _sequence: u64, _timeout: Option<Duration>) -> bool {
		false
	}

	fn is_poll_wait(&self) -> bool {
		false
	}

	fn poll_wake(&self) {}

	fn wake(&self) {}

	fn wake_all(&self) {}

	fn shutdown(&self, _mode: ShutdownMode) {}
}
