// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! The message model actors exchange.
//!
//! A message is a tagged variant over send, query, replay and stream
//! deliveries. Messages are immutable after construction; ownership moves
//! from the producer to the queue on a successful offer, and from the
//! queue to the worker thread that dequeues it.

use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::Error, reply::Reply};

/// Address of an actor. Cheap to clone, compared by path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(Arc<str>);

impl Address {
	pub fn new(path: impl AsRef<str>) -> Self {
		Self(Arc::from(path.as_ref()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for Address {
	fn from(path: &str) -> Self {
		Self::new(path)
	}
}

impl From<String> for Address {
	fn from(path: String) -> Self {
		Self(Arc::from(path.as_str()))
	}
}

/// Header mapping carried by a message, used for trace and context
/// propagation. Order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers(HashMap<String, Value>);

impl Headers {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.0.get(key)
	}

	pub fn set(&mut self, key: impl Into<String>, value: Value) {
		self.0.insert(key.into(), value);
	}

	pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
		self.set(key, value);
		self
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v))
	}
}

/// A message addressed to one actor.
#[derive(Debug)]
pub enum Message {
	/// Fire and forget method invocation.
	Send {
		target: Address,
		method: String,
		args: Vec<Value>,
		headers: Headers,
	},

	/// Method invocation with a result continuation.
	Query {
		target: Address,
		method: String,
		args: Vec<Value>,
		headers: Headers,
		reply: Reply,
	},

	/// A query re-driven from the journal before live delivery resumes.
	/// Its reply is a no-op continuation.
	ReplayQuery {
		target: Address,
		method: String,
		args: Vec<Value>,
		reply: Reply,
	},

	/// One element of a credit-gated stream.
	StreamUpdate {
		target: Address,
		sequence: u64,
		value: Value,
		headers: Headers,
	},

	/// Normal end of a stream.
	StreamComplete {
		target: Address,
		sequence: u64,
	},

	/// Terminal failure of a stream, propagated downstream.
	StreamFail {
		target: Address,
		error: Error,
	},
}

impl Message {
	pub fn send(target: impl Into<Address>, method: impl Into<String>, args: Vec<Value>) -> Self {
		Message::Send {
			target: target.into(),
			method: method.into(),
			args,
			headers: Headers::new(),
		}
	}

	pub fn query(
		target: impl Into<Address>,
		method: impl Into<String>,
		args: Vec<Value>,
		reply: Reply,
	) -> Self {
		Message::Query {
			target: target.into(),
			method: method.into(),
			args,
			headers: Headers::new(),
			reply,
		}
	}

	pub fn replay_query(target: impl Into<Address>, method: impl Into<String>, args: Vec<Value>) -> Self {
		Message::ReplayQuery {
			target: target.into(),
			method: method.into(),
			args,
			reply: Reply::ignore(),
		}
	}

	/// The actor this message is addressed to.
	pub fn target(&self) -> &Address {
		match self {
			Message::Send {
				target, ..
			}
			| Message::Query {
				target, ..
			}
			| Message::ReplayQuery {
				target, ..
			}
			| Message::StreamUpdate {
				target, ..
			}
			| Message::StreamComplete {
				target, ..
			}
			| Message::StreamFail {
				target, ..
			} => target,
		}
	}

	pub fn headers(&self) -> Option<&Headers> {
		match self {
			Message::Send {
				headers, ..
			}
			| Message::Query {
				headers, ..
			}
			| Message::StreamUpdate {
				headers, ..
			} => Some(headers),
			_ => None,
		}
	}

	pub fn headers_mut(&mut self) -> Option<&mut Headers> {
		match self {
			Message::Send {
				headers, ..
			}
			| Message::Query {
				headers, ..
			}
			| Message::StreamUpdate {
				headers, ..
			} => Some(headers),
			_ => None,
		}
	}

	/// The result continuation, if this variant carries one.
	pub fn reply(&self) -> Option<&Reply> {
		match self {
			Message::Query {
				reply, ..
			}
			| Message::ReplayQuery {
				reply, ..
			} => Some(reply),
			_ => None,
		}
	}

	pub fn is_replay(&self) -> bool {
		matches!(self, Message::ReplayQuery { .. })
	}

	/// Variant name for logging.
	pub fn kind(&self) -> &'static str {
		match self {
			Message::Send { .. } => "send",
			Message::Query { .. } => "query",
			Message::ReplayQuery { .. } => "replay-query",
			Message::StreamUpdate { .. } => "stream-update",
			Message::StreamComplete { .. } => "stream-complete",
			Message::StreamFail { .. } => "stream-fail",
		}
	}
}
