// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Bounded delivery queue over raw sequence counters.
//!
//! The ring is multi-producer, single-consumer: producers claim slots by
//! CAS on the allocation head, publish them through per-slot sequence
//! markers, and the worker that owns the queue advances the tail. The
//! invariant `tail <= head <= tail + capacity` holds for every reachable
//! state; a slot becomes visible to the consumer only after the producer's
//! release store on its sequence marker.

use std::{
	cell::UnsafeCell,
	mem::MaybeUninit,
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
	time::{Duration, Instant},
};

use tracing::error;

use crate::{
	blocker::RingBlocker,
	outbox::{MessageDeliver, Outbox},
	worker::Deliver,
};

/// How a queue is taken down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
	/// Drain remaining messages through `deliver` once more, then refuse
	/// further offers.
	Graceful,
	/// Discard queued messages and wake all parked producers and
	/// consumers so they observe closure instead of hanging.
	Immediate,
}

/// A failed offer hands the message back so the producer can react.
#[derive(Debug)]
pub enum OfferError<M> {
	/// The ring is at capacity.
	Full(M),
	/// The queue has been shut down.
	Closed(M),
}

impl<M> OfferError<M> {
	pub fn into_inner(self) -> M {
		match self {
			OfferError::Full(msg) | OfferError::Closed(msg) => msg,
		}
	}

	pub fn is_full(&self) -> bool {
		matches!(self, OfferError::Full(_))
	}

	pub fn is_closed(&self) -> bool {
		matches!(self, OfferError::Closed(_))
	}
}

struct Slot<M> {
	sequence: AtomicU64,
	value: UnsafeCell<MaybeUninit<M>>,
}

/// Bounded multi-producer single-consumer ring.
pub struct RingQueue<M> {
	slots: Box<[Slot<M>]>,
	mask: u64,
	/// Next slot a producer may claim.
	head: AtomicU64,
	/// Next slot available for consumption. Only the consumer side moves
	/// it, by CAS claim.
	tail: AtomicU64,
	closed: AtomicBool,
	blocker: Arc<dyn RingBlocker>,
}

// Slots hand values across threads exactly once; the sequence protocol
// guarantees exclusive access to each cell between publish and consume.
unsafe impl<M: Send> Send for RingQueue<M> {}
unsafe impl<M: Send> Sync for RingQueue<M> {}

impl<M: Send> RingQueue<M> {
	/// Create a ring with at least `capacity` slots, rounded up to a
	/// power of two.
	pub fn new(capacity: usize, blocker: Arc<dyn RingBlocker>) -> Self {
		let capacity = capacity.max(2).next_power_of_two();

		let slots = (0..capacity)
			.map(|i| Slot {
				sequence: AtomicU64::new(i as u64),
				value: UnsafeCell::new(MaybeUninit::uninit()),
			})
			.collect::<Vec<_>>()
			.into_boxed_slice();

		Self {
			slots,
			mask: capacity as u64 - 1,
			head: AtomicU64::new(0),
			tail: AtomicU64::new(0),
			closed: AtomicBool::new(false),
			blocker,
		}
	}

	pub fn capacity(&self) -> usize {
		self.slots.len()
	}

	/// Weakly consistent emptiness check. A scheduling hint, not a
	/// correctness gate.
	pub fn is_empty(&self) -> bool {
		self.tail.load(Ordering::Acquire) == self.head.load(Ordering::Acquire)
	}

	/// Approximate number of queued messages.
	pub fn len(&self) -> usize {
		let head = self.head.load(Ordering::Acquire);
		let tail = self.tail.load(Ordering::Acquire);
		head.saturating_sub(tail) as usize
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	pub fn blocker(&self) -> &Arc<dyn RingBlocker> {
		&self.blocker
	}

	/// Claim the next slot and publish `msg` into it. Never blocks.
	pub fn try_offer(&self, msg: M) -> Result<(), OfferError<M>> {
		if self.is_closed() {
			return Err(OfferError::Closed(msg));
		}

		let mask = self.mask;
		let mut head = self.head.load(Ordering::Relaxed);

		loop {
			let slot = &self.slots[(head & mask) as usize];
			let sequence = slot.sequence.load(Ordering::Acquire);
			let lag = sequence as i64 - head as i64;

			if lag == 0 {
				match self.head.compare_exchange_weak(
					head,
					head.wrapping_add(1),
					Ordering::Relaxed,
					Ordering::Relaxed,
				) {
					Ok(_) => {
						// Exclusive claim on the slot until the
						// sequence store publishes it.
						unsafe {
							(*slot.value.get()).write(msg);
						}
						slot.sequence.store(head.wrapping_add(1), Ordering::Release);
						self.blocker.poll_wake();
						return Ok(());
					}
					Err(actual) => head = actual,
				}
			} else if lag < 0 {
				// slot still holds the previous lap: head - tail == capacity
				return Err(OfferError::Full(msg));
			} else {
				// another producer claimed this slot first
				head = self.head.load(Ordering::Relaxed);
			}
		}
	}

	/// Blocking offer. `timeout` of `None` waits indefinitely; bounded
	/// waits give up with [`OfferError::Full`] once the deadline passes.
	pub fn offer(&self, msg: M, timeout: Option<Duration>) -> Result<(), OfferError<M>> {
		let deadline = timeout.map(|t| Instant::now() + t);
		let mut msg = msg;

		loop {
			msg = match self.try_offer(msg) {
				Ok(()) => return Ok(()),
				Err(OfferError::Closed(msg)) => return Err(OfferError::Closed(msg)),
				Err(OfferError::Full(msg)) => msg,
			};

			let sequence = self.blocker.next_offer_sequence();

			// re-check after registering the wait epoch so a consumer
			// advancing in between cannot strand this producer
			msg = match self.try_offer(msg) {
				Ok(()) => return Ok(()),
				Err(OfferError::Closed(msg)) => return Err(OfferError::Closed(msg)),
				Err(OfferError::Full(msg)) => msg,
			};

			let remaining = match deadline {
				None => None,
				Some(deadline) => {
					let now = Instant::now();
					if now >= deadline {
						return Err(OfferError::Full(msg));
					}
					Some(deadline - now)
				}
			};

			if !self.blocker.offer_wait(sequence, remaining) {
				return Err(OfferError::Full(msg));
			}
		}
	}

	/// Consume the next committed slot.
	///
	/// Normally called only by the owning worker's delivery loop. The
	/// tail is still claimed by CAS so the immediate-shutdown discard
	/// path cannot double-consume a slot it races with.
	pub fn poll(&self) -> Option<M> {
		let mut tail = self.tail.load(Ordering::Relaxed);

		loop {
			let slot = &self.slots[(tail & self.mask) as usize];
			let sequence = slot.sequence.load(Ordering::Acquire);
			let lag = sequence as i64 - tail.wrapping_add(1) as i64;

			if lag == 0 {
				match self.tail.compare_exchange_weak(
					tail,
					tail.wrapping_add(1),
					Ordering::Relaxed,
					Ordering::Relaxed,
				) {
					Ok(_) => {
						// claim is exclusive once the tail moved
						let msg = unsafe { (*slot.value.get()).assume_init_read() };
						slot.sequence
							.store(tail.wrapping_add(self.slots.len() as u64), Ordering::Release);
						return Some(msg);
					}
					Err(actual) => tail = actual,
				}
			} else if lag < 0 {
				// slot not yet published
				return None;
			} else {
				tail = self.tail.load(Ordering::Relaxed);
			}
		}
	}

	/// Drain committed slots into the consumer callback, up to
	/// `batch_max` messages. Producers parked on a full ring are released
	/// after the batch.
	pub fn deliver<D>(&self, deliver: &mut D, outbox: &mut Outbox<M>, batch_max: usize) -> usize
	where
		M: MessageDeliver,
		D: Deliver<M> + ?Sized,
	{
		let mut count = 0;

		while count < batch_max {
			let Some(msg) = self.poll() else {
				break;
			};

			count += 1;

			if let Err(error) = deliver.deliver(msg, outbox) {
				error!(%error, "delivery callback failed; continuing with next message");
			}
		}

		if count > 0 {
			self.blocker.offer_wake();
		}

		count
	}

	/// Refuse further offers. Queued messages stay deliverable.
	pub fn close(&self) {
		self.closed.store(true, Ordering::Release);
	}

	pub fn shutdown(&self, mode: ShutdownMode) {
		self.close();

		if mode == ShutdownMode::Immediate {
			while let Some(msg) = self.poll() {
				drop(msg);
			}
		}

		self.blocker.shutdown(mode);
	}
}

impl<M> Drop for RingQueue<M> {
	fn drop(&mut self) {
		// exclusive access here; drop any still-queued messages in place
		let mask = self.mask;
		let mut tail = self.tail.load(Ordering::Relaxed);
		let head = self.head.load(Ordering::Relaxed);

		while tail != head {
			let slot = &self.slots[(tail & mask) as usize];
			if slot.sequence.load(Ordering::Relaxed) == tail.wrapping_add(1) {
				unsafe {
					(*slot.value.get()).assume_init_drop();
				}
			}
			tail = tail.wrapping_add(1);
		}
	}
}
