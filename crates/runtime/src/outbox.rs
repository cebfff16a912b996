// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Per-batch accumulator for messages emitted while a handler runs.
//!
//! The outbox is an explicit value threaded through the delivery loop,
//! never an ambient thread-local. Messages accumulate in emission order
//! and are re-offered to their own target queues at batch end. The
//! execute-last optimization runs the final message inline on the current
//! thread when the target worker is idle, saving a wake round-trip.

use std::{collections::VecDeque, time::Duration};

use tracing::error;

/// How long a flush may park on a full target queue before rejecting the
/// message loudly.
const FLUSH_OFFER_TIMEOUT: Duration = Duration::from_secs(10);

/// A message that knows its own destination.
pub trait MessageDeliver: Sized + Send + 'static {
	/// Offer this message into its target queue and wake the target's
	/// worker. Hands the message back on failure.
	fn offer_target(self, timeout: Option<Duration>) -> Result<(), Self>;

	/// Attempt to run the target's delivery inline on the calling thread
	/// with this message as the tail message.
	fn run_one_target(self, outbox: &mut Outbox<Self>) -> RunOne<Self>;
}

/// Outcome of an inline execution attempt.
#[derive(Debug)]
pub enum RunOne<M> {
	/// The message was delivered inline or queued in order.
	Done,
	/// The target could not take the message; the caller must retry.
	Retry(M),
}

/// Outcome of [`Outbox::flush_and_execute_last`]. Callers must loop on
/// [`FlushOutcome::MoreWork`] until drained, or give up and rely on the
/// target worker to finish later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
	Drained,
	MoreWork,
}

/// Accumulator bound to whichever thread currently runs a delivery batch.
pub struct Outbox<M: MessageDeliver> {
	pending: VecDeque<M>,
}

impl<M: MessageDeliver> Outbox<M> {
	pub fn new() -> Self {
		Self {
			pending: VecDeque::new(),
		}
	}

	/// Append a message emitted by handler code.
	pub fn accept(&mut self, msg: M) {
		self.pending.push_back(msg);
	}

	pub fn is_empty(&self) -> bool {
		self.pending.is_empty()
	}

	pub fn len(&self) -> usize {
		self.pending.len()
	}

	/// Re-offer every accumulated message to its own target queue, in
	/// accumulation order, then clear the outbox.
	pub fn flush(&mut self) {
		while let Some(msg) = self.pending.pop_front() {
			Self::offer_or_reject(msg);
		}
	}

	/// Flush, executing the last message inline when possible.
	///
	/// The outbox may not be drained on return: executing the last
	/// message can itself emit further messages.
	pub fn flush_and_execute_last(&mut self) -> FlushOutcome {
		while self.pending.len() > 1 {
			let msg = self.pending.pop_front().expect("length checked above");
			Self::offer_or_reject(msg);
		}

		let Some(last) = self.pending.pop_front() else {
			return FlushOutcome::Drained;
		};

		match last.run_one_target(self) {
			RunOne::Done => {}
			RunOne::Retry(msg) => Self::offer_or_reject(msg),
		}

		if self.pending.is_empty() {
			FlushOutcome::Drained
		} else {
			FlushOutcome::MoreWork
		}
	}

	fn offer_or_reject(msg: M) {
		if msg.offer_target(Some(FLUSH_OFFER_TIMEOUT)).is_err() {
			// never silent: the producer side must be able to react
			error!("outbox flush could not deliver a message; rejecting it");
		}
	}
}

impl<M: MessageDeliver> Default for Outbox<M> {
	fn default() -> Self {
		Self::new()
	}
}
