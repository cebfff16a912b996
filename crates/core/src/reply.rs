// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! At-most-once result continuations.
//!
//! A [`Reply`] is invoked with either a value or a failure, at most once.
//! The caller may cancel it; once cancelled, `ok` and `fail` become
//! idempotent no-ops rather than errors.

use std::{
	fmt,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::error::{Error, Result};

type Complete = Box<dyn FnOnce(Result<Value>) + Send>;

struct Shared {
	callback: Mutex<Option<Complete>>,
	cancelled: AtomicBool,
}

/// Result continuation for a query or stream terminal.
///
/// Cloning shares the same underlying continuation; whichever clone
/// completes first wins, all later completions are dropped.
#[derive(Clone)]
pub struct Reply {
	shared: Arc<Shared>,
}

impl Reply {
	pub fn new(complete: impl FnOnce(Result<Value>) + Send + 'static) -> Self {
		Self {
			shared: Arc::new(Shared {
				callback: Mutex::new(Some(Box::new(complete))),
				cancelled: AtomicBool::new(false),
			}),
		}
	}

	/// A continuation that discards its result. Used for replayed
	/// queries, whose results were already delivered in a previous life.
	pub fn ignore() -> Self {
		Self {
			shared: Arc::new(Shared {
				callback: Mutex::new(None),
				cancelled: AtomicBool::new(false),
			}),
		}
	}

	pub fn ok(&self, value: Value) {
		self.complete(Ok(value));
	}

	pub fn fail(&self, error: Error) {
		self.complete(Err(error));
	}

	/// Mark this continuation cancelled. Idempotent; any subsequent
	/// `ok`/`fail` is a no-op.
	pub fn cancel(&self) {
		self.shared.cancelled.store(true, Ordering::Release);
	}

	pub fn is_cancelled(&self) -> bool {
		self.shared.cancelled.load(Ordering::Acquire)
	}

	/// True once the continuation has fired (or never had a callback).
	pub fn is_complete(&self) -> bool {
		self.shared.callback.lock().is_none()
	}

	fn complete(&self, result: Result<Value>) {
		if self.is_cancelled() {
			trace!("reply completed after cancel; ignored");
			return;
		}

		let callback = self.shared.callback.lock().take();

		if let Some(callback) = callback {
			callback(result);
		}
	}
}

impl fmt::Debug for Reply {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Reply")
			.field("cancelled", &self.is_cancelled())
			.field("complete", &self.is_complete())
			.finish()
	}
}
