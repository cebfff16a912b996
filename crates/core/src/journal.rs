// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Durability hook contract.
//!
//! The runtime calls into a [`Journal`] around each send/query and at
//! batch boundaries, and drives a replay pass at startup before live
//! delivery begins. The journal implementation itself lives outside this
//! core; [`NullJournal`] satisfies the contract trivially so a runtime can
//! run with durability disabled.

use serde_json::Value;

use crate::{
	error::Result,
	message::{Address, Message},
	reply::Reply,
};

/// Sink the journal offers replayed messages into during
/// [`Journal::replay_start`].
pub type ReplaySink<'a> = dyn FnMut(Message) -> Result<()> + 'a;

/// Durability hooks invoked by the delivery path.
///
/// `write_send`/`write_query` run synchronously on the delivering thread,
/// before the message takes effect. `flush` runs at batch boundaries.
pub trait Journal: Send + Sync {
	/// Record a send before it is applied.
	fn write_send(&self, target: &Address, method: &str, args: &[Value]);

	/// Record a query before it is applied.
	fn write_query(&self, target: &Address, method: &str, args: &[Value]);

	/// Flush buffered records. Called at batch boundaries.
	fn flush(&self);

	/// Whether the journal wants a checkpoint.
	fn is_save_request(&self) -> bool {
		false
	}

	/// Begin a checkpoint. Returns false if one is already in flight.
	fn save_start(&self) -> bool {
		true
	}

	/// Finish a checkpoint.
	fn save_end(&self, _complete: bool) {}

	/// Replay journaled messages into `replay` and fire `done` once the
	/// pass is finished. Called once at startup; live delivery resumes
	/// only after `done` fires.
	fn replay_start(&self, done: Reply, replay: &mut ReplaySink<'_>);
}

/// Journal that records nothing and replays nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

impl Journal for NullJournal {
	fn write_send(&self, _target: &Address, _method: &str, _args: &[Value]) {}

	fn write_query(&self, _target: &Address, _method: &str, _args: &[Value]) {}

	fn flush(&self) {}

	fn replay_start(&self, done: Reply, _replay: &mut ReplaySink<'_>) {
		done.ok(Value::Bool(true));
	}
}

#[cfg(test)]
mod tests {
	use std::sync::mpsc;

	use super::*;

	#[test]
	fn test_null_journal_replay_completes_immediately() {
		let (tx, rx) = mpsc::channel();
		let done = Reply::new(move |result| tx.send(result).unwrap());

		let mut offered = 0;
		NullJournal.replay_start(done, &mut |_msg| {
			offered += 1;
			Ok(())
		});

		assert_eq!(offered, 0, "null journal must not replay anything");
		assert!(rx.try_recv().unwrap().is_ok(), "done must fire synchronously");
	}

	#[test]
	fn test_null_journal_checkpoint_hooks() {
		assert!(!NullJournal.is_save_request());
		assert!(NullJournal.save_start());
		NullJournal.save_end(true);
		NullJournal.flush();
	}
}
