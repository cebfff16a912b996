// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Error taxonomy of the messaging core.
//!
//! Capacity and handler failures are reported to the immediate caller or
//! reply continuation. Invariant violations are not represented here: they
//! are logged loudly at the point of detection and never "recovered".

use std::result;

/// Errors surfaced by the messaging core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// The target queue is at capacity and no blocking policy applied.
	#[error("queue is full")]
	QueueFull,

	/// The target queue has been shut down; offers fail fast.
	#[error("queue is closed")]
	QueueClosed,

	/// The producer has no remaining credit on this pipe.
	#[error("credit exhausted")]
	CreditExhausted,

	/// The consumer paused the pipe; sends are rejected regardless of
	/// remaining credit.
	#[error("flow is paused")]
	FlowPaused,

	/// The pipe failed terminally; no further sends are possible.
	#[error("flow failed: {0}")]
	FlowFailed(String),

	/// A handler panicked while processing a message. The worker thread
	/// survives; queries observe this through their reply.
	#[error("handler panicked: {0}")]
	HandlerPanic(String),

	/// Invalid configuration, reported before any state mutation.
	#[error("invalid configuration: {0}")]
	Config(String),
}

pub type Result<T> = result::Result<T, Error>;
