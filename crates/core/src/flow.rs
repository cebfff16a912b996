// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Credit-based flow control between a pipe's producer and consumer.
//!
//! The consumer grants credits; the producer must never send more units
//! than its outstanding credit. `pause`/`resume` let the consumer halt the
//! producer irrespective of remaining credit, and `fail` is terminal.

use std::sync::{
	Arc,
	atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

struct Gate {
	/// Total units ever granted by the consumer. Monotonic.
	granted: AtomicU64,
	/// Total units ever claimed by the producer. `sent <= granted` always.
	sent: AtomicU64,
	paused: AtomicBool,
	failed: AtomicBool,
	failure: Mutex<Option<Error>>,
}

/// Create a connected consumer/producer pair over a fresh gate with zero
/// initial credit.
pub fn gate() -> (FlowIn, FlowOut) {
	let gate = Arc::new(Gate {
		granted: AtomicU64::new(0),
		sent: AtomicU64::new(0),
		paused: AtomicBool::new(false),
		failed: AtomicBool::new(false),
		failure: Mutex::new(None),
	});

	(
		FlowIn {
			gate: Arc::clone(&gate),
		},
		FlowOut {
			gate,
		},
	)
}

/// Consumer side of the flow contract.
#[derive(Clone)]
pub struct FlowIn {
	gate: Arc<Gate>,
}

impl FlowIn {
	/// Grant `n` additional units to the producer.
	pub fn credit(&self, n: u64) {
		self.gate.granted.fetch_add(n, Ordering::AcqRel);
	}

	/// Hard stop, independent of remaining credit.
	pub fn pause(&self) {
		self.gate.paused.store(true, Ordering::Release);
	}

	pub fn resume(&self) {
		self.gate.paused.store(false, Ordering::Release);
	}

	/// Fail the pipe terminally. Producers observe the error on every
	/// subsequent claim and must propagate it downstream.
	pub fn fail(&self, error: Error) {
		debug!(%error, "flow failed");
		*self.gate.failure.lock() = Some(error);
		self.gate.failed.store(true, Ordering::Release);
	}

	/// Units granted but not yet claimed by the producer.
	pub fn available(&self) -> u64 {
		let granted = self.gate.granted.load(Ordering::Acquire);
		let sent = self.gate.sent.load(Ordering::Acquire);
		granted.saturating_sub(sent)
	}
}

/// Producer side of the flow contract.
#[derive(Clone)]
pub struct FlowOut {
	gate: Arc<Gate>,
}

impl FlowOut {
	/// Claim one unit of credit.
	///
	/// Checks terminal failure first, then pause, then credit. A paused
	/// pipe rejects even with positive credit remaining.
	pub fn try_acquire(&self) -> Result<()> {
		if self.gate.failed.load(Ordering::Acquire) {
			let detail = self
				.gate
				.failure
				.lock()
				.as_ref()
				.map(|e| e.to_string())
				.unwrap_or_else(|| "unknown".to_string());
			return Err(Error::FlowFailed(detail));
		}

		if self.gate.paused.load(Ordering::Acquire) {
			return Err(Error::FlowPaused);
		}

		loop {
			let sent = self.gate.sent.load(Ordering::Acquire);

			if sent >= self.gate.granted.load(Ordering::Acquire) {
				return Err(Error::CreditExhausted);
			}

			if self.gate
				.sent
				.compare_exchange(sent, sent + 1, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				return Ok(());
			}
		}
	}

	pub fn available(&self) -> u64 {
		let granted = self.gate.granted.load(Ordering::Acquire);
		let sent = self.gate.sent.load(Ordering::Acquire);
		granted.saturating_sub(sent)
	}

	pub fn is_paused(&self) -> bool {
		self.gate.paused.load(Ordering::Acquire)
	}

	pub fn is_failed(&self) -> bool {
		self.gate.failed.load(Ordering::Acquire)
	}
}
